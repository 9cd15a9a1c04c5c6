#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Runs a [`Shaper`] on tokio.
//!
//! [`ShaperHandle::spawn`] moves an engine behind a lock, drives its clock from a tokio interval
//! and hands delivered packets to an [`EgressStream`]. The handle is cheap to clone and every
//! call on it runs to completion under the lock, so it can be shared by any number of
//! producers.

use thiserror::Error;

mod driver;

mod egress;
pub use egress::*;

mod handle;
pub use handle::*;

pub use shaper_core::*;

/// Packets buffered between the delay lines and the [`EgressStream`] by default.
pub const DEFAULT_EGRESS_BUFFER: usize = 1024;

/// Commands buffered for the tick driver.
const DEFAULT_BUFFER_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("shaper driver closed")]
    Closed,
}

#[derive(Debug)]
pub(crate) enum Command {
    /// Restart the tick interval at a new rate. The engine itself is already updated.
    SetHz(u32),
    Shutdown,
}
