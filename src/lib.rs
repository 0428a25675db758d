pub mod bitset;
pub mod config;
pub mod error;
pub mod queue;
pub mod reclaimer;
pub mod scheduler;
pub mod shutdown;
pub mod worker;
