use thiserror::Error;

/// Fatal simulation errors.
///
/// Every error here aborts the tick that raised it. There is no retry or
/// degraded mode: a capacity or invariant failure leaves the device
/// population in an unknown state and the simulation must be torn down.
#[derive(Error, Debug)]
pub enum SimError {
    /// A device buffer could not grow to the requested size.
    #[error("buffer `{buffer}` cannot grow to {requested_bytes} bytes (device limit: {limit})")]
    Capacity {
        buffer: &'static str,
        requested_bytes: u64,
        limit: u64,
    },
    /// A structural invariant of the device population was violated.
    #[error("invariant violated: {what}")]
    Invariant { what: String },
    /// A kernel dispatch or readback failed.
    #[error("dispatch failed: {what}")]
    Dispatch { what: String },
}

impl SimError {
    pub fn invariant(what: impl Into<String>) -> Self {
        SimError::Invariant { what: what.into() }
    }

    pub fn dispatch(what: impl Into<String>) -> Self {
        SimError::Dispatch { what: what.into() }
    }
}
