pub mod aggregator;
pub mod candidate;
pub mod clock;
pub mod config;
pub mod engine;
pub mod outcome;
pub mod session;
pub mod utils;
