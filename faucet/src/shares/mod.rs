/// Share checking
///
/// `validator` answers whether nonces solve a preimage; `verification`
/// decides who checks each submitted share and settles the outcome.

pub mod validator;
pub mod verification;

pub use validator::{meets_difficulty, PowValidator, ScryptHasher, ShareHasher, ShareValidator};
pub use verification::{ShareVerifier, VerificationResult};
