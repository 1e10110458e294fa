//! Core types for the agentbus agent communication core.
//!
//! This crate defines the data model shared by the wire layer and the kernel:
//! typed IO values and their constraints, agent definitions, mapping tables,
//! agent identity, events and configuration. It performs validation but no I/O.

pub mod agent;
pub mod config;
pub mod constraint;
pub mod definition;
pub mod error;
pub mod event;
pub mod mapping;
pub mod serde_compat;
pub mod value;
