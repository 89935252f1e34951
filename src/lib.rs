pub mod core;
pub mod miner;
pub mod node;
pub mod pow;
pub mod storage;
