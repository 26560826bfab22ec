//! # tribunal-core
//!
//! Core types for the tribunal elimination-debate orchestrator.
//!
//! A game is a fixed roster of AI participants. Each round they debate a
//! topic, vote a suspect into a final defense, vote again, and re-debate on
//! ties until exactly one participant is eliminated.
//!
//! ## Core Paradigm
//!
//! - Records are explicit typed structs with constructor defaults
//! - A round carries exactly one authoritative [`Phase`]
//! - Votes are per (round, phase) pass and never target their own voter
//! - Everything the orchestrator needs after a restart is persisted

pub mod config;
mod error;
mod types;

pub use config::TribunalConfig;
pub use error::{Result, TribunalError};
pub use types::*;
