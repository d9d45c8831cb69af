pub mod chain;
pub mod error;
pub mod fees;
pub mod heads;
pub mod signer;
pub mod transaction;
