//! Asynchronous camera capture pipeline
//!
//! A [`CameraDevice`](device::CameraDevice) session drives a hardware
//! abstraction ([`hal::HalSession`]) through configured streams: capture
//! requests go in, pipelined buffers and strictly ordered metadata
//! results come out. A dedicated worker thread owns submission; hardware
//! callbacks resolve in-flight frames asynchronously.

pub mod buffer;
pub mod device;
pub mod error;
pub mod hal;
pub mod metadata;
pub mod request;
pub mod stream;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use device::{CameraDevice, CaptureResult, DeviceListener, DeviceState};
pub use error::{CameraError, Result};
pub use request::CaptureRequest;

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Drain deadline for disconnect and explicit drain waits.
    pub shutdown_ms: u64,
    /// Quiet window after which the worker reports itself idle.
    pub request_starvation_ms: u64,
    /// Per-buffer acquisition deadline during request assembly.
    pub buffer_acquire_ms: u64,
    /// Deadline for the pipeline to quiesce around a reconfiguration.
    pub active_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig {
                shutdown_ms: 5000,
                request_starvation_ms: 50,
                buffer_acquire_ms: 1000,
                active_ms: 1000,
            },
        }
    }
}

impl Config {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.shutdown_ms)
    }

    pub fn request_starvation_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.request_starvation_ms)
    }

    pub fn buffer_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.buffer_acquire_ms)
    }

    pub fn active_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.active_ms)
    }
}
