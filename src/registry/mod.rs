//! Provenance registry: company credentials, hash-chain anchoring, and
//! signature-joined verification.

pub mod chain;
pub mod credentials;
pub mod responses;
pub mod signature;
pub mod verification;
