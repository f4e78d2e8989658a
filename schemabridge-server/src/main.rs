// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use anyhow::Result;
use clap::Parser;
use schemabridge_observability::LogFormat;
use schemabridge_server::{run_server, ServerConfig};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "schemabridge-server")]
#[command(about = "SchemaBridge tool server with pooling, caching and batching", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "SCHEMABRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address (overrides config and environment)
    #[arg(long)]
    listen_addr: Option<String>,

    /// Log output format: pretty or json
    #[arg(long)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ServerConfig::load(args.config)?;
    if let Some(addr) = args.listen_addr {
        config.server.listen_addr = addr;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    run_server(config).await
}
