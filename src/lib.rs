pub mod config;
pub mod error;
pub mod gate;
pub mod log;
pub mod pool;
pub mod process;
pub mod provider;
pub mod report;
pub mod scheduler;
pub mod tracker;
pub mod types;
