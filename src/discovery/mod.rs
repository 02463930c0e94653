mod service;
mod shard;

pub use service::{Discovery, DiscoveryError};
pub use shard::{assigned_shard, should_process};
