//! Watermarking and provenance for LLM-generated text.
//!
//! Two independent watermark channels compose into one request:
//!
//! - A **statistical** channel biases sampling toward a per-context
//!   pseudorandom "green" token subset, recoverable later by rescoring the
//!   output against the same key schedule ([`statistical`], [`detector`]).
//! - A **zero-width tag** channel embeds a CRC-checked metadata payload as
//!   invisible Unicode codepoints directly in the output text
//!   ([`payload`], [`zero_width`]).
//!
//! A provenance [`registry`] layer sits above both: registered issuers sign
//! the hash of their watermarked output and anchor it to an append-only
//! chain, so a verifier can ask not just "is this watermarked" but "who
//! produced this".
#![deny(rust_2018_idioms)]

pub mod config;
pub mod detector;
pub mod error;
pub mod gateway;
pub mod integrations;
pub mod keys;
pub mod payload;
pub mod policy;
pub mod registry;
pub mod statistical;
pub mod zero_width;

pub use error::{Result, WatermarkError};
