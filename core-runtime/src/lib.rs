//! # Core Runtime Module
//!
//! Foundational runtime infrastructure shared by the playback engine:
//! - Logging and tracing infrastructure
//! - Runtime configuration and capability wiring
//! - Event bus for track and stream events
//!
//! The engine itself lives in `core-playback`; this crate holds everything a
//! host needs to observe and configure it without depending on decode
//! internals.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
