//! IO boundaries - frame ingestion and durable egress
//!
//! - `replay` - detection frame sources (recorded JSONL logs)
//! - `gateway` - persistence gateway trait and implementations
//! - `spill` - fallback delta log for gateway outages

pub mod gateway;
pub mod replay;
pub mod spill;

pub use gateway::{GatewayError, JsonlGateway, MemoryGateway, PersistenceGateway};
pub use replay::{DetectionSource, JsonlReplay, ScriptedSource};
pub use spill::SpillLog;
