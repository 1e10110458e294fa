//! Core kernel for agentbus.
//!
//! A [`Kernel`] hosts named [`Agent`]s that publish typed outputs, receive
//! mapped inputs, call each other's services, run elections and exchange
//! channel messages with agents hosted by other kernels on the network.

pub mod agent;
pub mod config;
pub mod definition;
pub mod election;
pub mod error;
pub mod event_bus;
pub mod kernel;
pub mod logging;
pub mod mapping;
pub mod monitor;
pub mod realtime;
pub mod remote;
pub mod service;
pub mod supervisor;
pub mod timer;

mod scheduler;
mod worker;

pub use agent::Agent;
pub use definition::DefinitionStore;
pub use error::{KernelError, KernelResult};
pub use kernel::Kernel;
pub use mapping::MappingEngine;
pub use monitor::{NetworkProbe, StaticProbe};
pub use remote::RemoteAgent;
pub use timer::TimerId;
