//! # tribunal-store
//!
//! The persistence gateway for tribunal.
//!
//! This crate provides:
//! - [`PersistenceGateway`], the single source of truth the orchestrator reads
//!   and writes through
//! - [`JsonStore`], an implementation that keeps state in memory and flushes an
//!   atomic JSON snapshot after every committed mutation

mod gateway;
mod json_store;

pub use gateway::{PersistenceGateway, SequenceSlot};
pub use json_store::JsonStore;
