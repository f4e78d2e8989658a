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

//! SchemaBridge core types
//!
//! Shared vocabulary for the request performance layer:
//!
//! - [`PerfError`]: typed failures raised by the pool, cache, batcher and dispatcher
//! - [`ToolInvoker`]: the contract every tool handler backend implements
//! - [`CacheKey`]: deterministic request fingerprints

pub mod error;
pub mod fingerprint;
pub mod invoker;

pub use error::{PerfError, Result, ToolError};
pub use fingerprint::{canonical_json, CacheKey};
pub use invoker::{BatchItem, BatchOutput, ToolInvoker};
