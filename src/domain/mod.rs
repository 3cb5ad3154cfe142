pub mod miner;
pub mod types;

pub use miner::*;
pub use types::*;
