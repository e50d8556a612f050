pub mod manager;
pub mod recovery;
pub mod state;
pub mod timers;

pub use manager::{SessionManager, SessionOrigin};
pub use recovery::{RecoveryInfo, TokenError, TokenSigner};
pub use state::{MinerSession, SessionStatus, SlashReason, HASHRATE_WINDOW};
