//! Kernel-specific error types.

use agentbus_types::error::BusError;
use agentbus_wire::WireError;
use thiserror::Error;

/// Kernel error type wrapping the structural and transport errors.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A wrapped BusError.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// A transport failure.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The kernel failed to boot.
    #[error("Boot failed: {0}")]
    BootFailed(String),
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
