pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod shares;
pub mod storage;
pub mod payout;
pub mod rewards;
pub mod server;
pub mod metrics;
