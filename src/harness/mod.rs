//! Reusable helpers for the `copilot-sdk-harness` binary.
//!
//! # Modules
//!
//! - [`logger`] - stderr `log` backend with env/flag level selection
//! - [`transcript`] - transcript file writing (tee stdout + file)
//! - [`approval`] - permission policy and run flags

pub mod approval;
pub mod logger;
pub mod transcript;

pub use approval::{ApprovalPolicy, HarnessEventFlags, describe_request};
pub use logger::{LOG_ENV, init_logger, parse_level, resolve_level};
pub use transcript::{init_transcript, print_tee, println_tee};
