//! Stream abstractions: one data channel to or from the hardware
//!
//! Four variants share one minimal base contract (buffer get/return,
//! two-phase configuration, disconnect); variant-specific buffer sourcing
//! lives in each implementation, composed around [`StreamCore`] rather
//! than inherited.

pub mod consumer;
pub mod input;
pub mod output;
pub mod placeholder;
pub mod zsl;

pub use consumer::{BufferConsumer, BufferProducer, FifoQueue};
pub use input::InputStream;
pub use output::OutputStream;
pub use placeholder::PlaceholderStream;
pub use zsl::ZslStream;

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::buffer::{BufferUsage, PixelFormat, SetId};
use crate::error::{CameraError, Result};
use crate::hal::{HalStreamConfig, StreamBuffer, StreamKind};

/// Numeric stream id, unique within one device.
pub type StreamId = i32;

/// Output rotation applied by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

/// Stream configuration lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, never configured.
    Constructed,
    /// First configuration in progress.
    InConfig,
    /// Reconfiguration of an already-configured stream in progress.
    InReconfig,
    /// Registered with the hardware, ready for buffer traffic.
    Configured,
    /// Disconnected; all further operations fail.
    Abandoned,
}

impl StreamState {
    fn name(self) -> &'static str {
        match self {
            StreamState::Constructed => "constructed",
            StreamState::InConfig => "in-config",
            StreamState::InReconfig => "in-reconfig",
            StreamState::Configured => "configured",
            StreamState::Abandoned => "abandoned",
        }
    }
}

/// Static and negotiated attributes of a stream.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub id: StreamId,
    /// Buffer-sharing group membership, if manager-backed.
    pub set_id: Option<SetId>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub dataspace: u32,
    pub rotation: Rotation,
    /// Usage flags; the hardware may raise these during configuration.
    pub usage: BufferUsage,
    /// Hand-out ceiling; committed at `finish_configuration`.
    pub max_buffers: usize,
}

/// Base contract every stream variant implements.
pub trait StreamInterface: Send + Sync {
    fn id(&self) -> StreamId;
    fn set_id(&self) -> Option<SetId>;
    fn kind(&self) -> StreamKind;
    fn info(&self) -> StreamInfo;
    fn state(&self) -> StreamState;

    /// Begin (re)configuration, exposing properties for the hardware to
    /// inspect and adjust before commit.
    fn start_configuration(&self) -> Result<HalStreamConfig>;

    /// Commit the (possibly hardware-adjusted) configuration.
    fn finish_configuration(&self, config: &HalStreamConfig) -> Result<()>;

    /// Roll back an in-progress configuration.
    fn cancel_configuration(&self) -> Result<()>;

    /// Acquire one buffer for the hardware to fill.
    fn get_buffer(&self, timeout: Duration) -> Result<StreamBuffer>;

    /// Give a buffer back with the frame's shutter timestamp. Errored
    /// buffers are cancelled rather than presented.
    fn return_buffer(&self, buffer: StreamBuffer, timestamp: i64) -> Result<()>;

    /// Acquire a filled buffer for reprocessing. Only input-capable
    /// variants support this.
    fn acquire_input_buffer(&self, _timeout: Duration) -> Result<StreamBuffer> {
        Err(CameraError::InvalidState {
            op: "acquire_input_buffer",
            state: format!("stream {} is not input-capable", self.id()),
        })
    }

    /// Return a reprocessing buffer. Only input-capable variants.
    fn release_input_buffer(&self, _buffer: StreamBuffer) -> Result<()> {
        Err(CameraError::InvalidState {
            op: "release_input_buffer",
            state: format!("stream {} is not input-capable", self.id()),
        })
    }

    fn outstanding_buffers(&self) -> usize;

    /// Block until no buffers remain handed out.
    fn wait_until_idle(&self, timeout: Duration) -> Result<()>;

    /// Pre-allocate up to `max_count` buffers off the hot path.
    fn prepare(&self, _max_count: usize) -> Result<()> {
        Err(CameraError::BadParameter(format!(
            "stream {} does not support prepare",
            self.id()
        )))
    }

    /// Drop cached buffers pre-allocated by `prepare`.
    fn tear_down(&self) -> Result<()> {
        Ok(())
    }

    /// Idempotent teardown; refuses while buffers are outstanding.
    fn disconnect(&self) -> Result<()>;
}

struct CoreState {
    state: StreamState,
    handed_out: usize,
    info: StreamInfo,
}

/// Shared bookkeeping embedded by every stream variant: configuration
/// state machine, hand-out accounting against `max_buffers`, idle waits.
pub(crate) struct StreamCore {
    kind: StreamKind,
    state: Mutex<CoreState>,
    cond: Condvar,
}

impl StreamCore {
    pub(crate) fn new(info: StreamInfo, kind: StreamKind) -> Self {
        Self {
            kind,
            state: Mutex::new(CoreState {
                state: StreamState::Constructed,
                handed_out: 0,
                info,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn id(&self) -> StreamId {
        self.state.lock().unwrap().info.id
    }

    pub(crate) fn set_id(&self) -> Option<SetId> {
        self.state.lock().unwrap().info.set_id
    }

    pub(crate) fn kind(&self) -> StreamKind {
        self.kind
    }

    pub(crate) fn info(&self) -> StreamInfo {
        self.state.lock().unwrap().info.clone()
    }

    pub(crate) fn state(&self) -> StreamState {
        self.state.lock().unwrap().state
    }

    pub(crate) fn start_configuration(&self) -> Result<HalStreamConfig> {
        let mut guard = self.state.lock().unwrap();
        guard.state = match guard.state {
            StreamState::Constructed => StreamState::InConfig,
            StreamState::Configured => StreamState::InReconfig,
            other => {
                return Err(CameraError::InvalidState {
                    op: "start_configuration",
                    state: other.name().into(),
                })
            }
        };
        let info = &guard.info;
        Ok(HalStreamConfig {
            stream_id: info.id,
            kind: self.kind,
            width: info.width,
            height: info.height,
            format: info.format,
            usage: info.usage,
            max_buffers: info.max_buffers,
        })
    }

    pub(crate) fn finish_configuration(&self, config: &HalStreamConfig) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        match guard.state {
            StreamState::InConfig | StreamState::InReconfig => {}
            other => {
                return Err(CameraError::InvalidState {
                    op: "finish_configuration",
                    state: other.name().into(),
                })
            }
        }
        if config.max_buffers == 0 {
            return Err(CameraError::BadParameter(format!(
                "stream {}: zero max_buffers from configuration",
                guard.info.id
            )));
        }
        guard.info.usage = config.usage;
        guard.info.max_buffers = config.max_buffers;
        guard.state = StreamState::Configured;
        debug!(
            stream_id = guard.info.id,
            max_buffers = guard.info.max_buffers,
            "stream configured"
        );
        Ok(())
    }

    pub(crate) fn cancel_configuration(&self) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        guard.state = match guard.state {
            StreamState::InConfig => StreamState::Constructed,
            StreamState::InReconfig => StreamState::Configured,
            other => {
                return Err(CameraError::InvalidState {
                    op: "cancel_configuration",
                    state: other.name().into(),
                })
            }
        };
        Ok(())
    }

    /// Account one buffer leaving the stream; enforces the hand-out cap.
    pub(crate) fn note_buffer_out(&self) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        if guard.state != StreamState::Configured {
            return Err(CameraError::InvalidState {
                op: "get_buffer",
                state: guard.state.name().into(),
            });
        }
        if guard.handed_out >= guard.info.max_buffers {
            return Err(CameraError::BufferLimit {
                stream: guard.info.id,
                max: guard.info.max_buffers,
            });
        }
        guard.handed_out += 1;
        Ok(())
    }

    /// Like [`note_buffer_out`](Self::note_buffer_out), but when the
    /// hand-out count sits at the cap this blocks until a buffer comes
    /// back or `timeout` expires. A full pipeline is the normal steady
    /// state while the hardware works through submitted frames, so the
    /// hot acquisition path must wait rather than fail.
    pub(crate) fn note_buffer_out_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock().unwrap();
        loop {
            if guard.state != StreamState::Configured {
                return Err(CameraError::InvalidState {
                    op: "get_buffer",
                    state: guard.state.name().into(),
                });
            }
            if guard.handed_out < guard.info.max_buffers {
                guard.handed_out += 1;
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CameraError::Timeout {
                    what: "free stream slot",
                    after: timeout,
                });
            }
            let (g, _) = self.cond.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
        }
    }

    /// Undo `note_buffer_out` after a failed acquisition downstream.
    pub(crate) fn revert_buffer_out(&self) {
        let mut guard = self.state.lock().unwrap();
        if guard.handed_out > 0 {
            guard.handed_out -= 1;
        }
        self.cond.notify_all();
    }

    pub(crate) fn note_buffer_returned(&self) {
        let mut guard = self.state.lock().unwrap();
        if guard.handed_out == 0 {
            warn!(stream_id = guard.info.id, "buffer returned with none outstanding");
        } else {
            guard.handed_out -= 1;
        }
        self.cond.notify_all();
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.state.lock().unwrap().handed_out
    }

    pub(crate) fn wait_until_idle(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock().unwrap();
        while guard.handed_out > 0 {
            let now = Instant::now();
            if now >= deadline {
                return Err(CameraError::Timeout {
                    what: "stream idle",
                    after: timeout,
                });
            }
            let (g, _) = self.cond.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
        }
        Ok(())
    }

    /// Transition to Abandoned. Returns false when already abandoned
    /// (disconnect is idempotent); refuses while buffers are outstanding.
    pub(crate) fn begin_disconnect(&self) -> Result<bool> {
        let mut guard = self.state.lock().unwrap();
        if guard.state == StreamState::Abandoned {
            return Ok(false);
        }
        if guard.handed_out > 0 {
            return Err(CameraError::BuffersOutstanding {
                stream: guard.info.id,
                outstanding: guard.handed_out,
            });
        }
        guard.state = StreamState::Abandoned;
        self.cond.notify_all();
        Ok(true)
    }

    pub(crate) fn ensure_configured(&self, op: &'static str) -> Result<()> {
        let guard = self.state.lock().unwrap();
        if guard.state == StreamState::Configured {
            Ok(())
        } else {
            Err(CameraError::InvalidState {
                op,
                state: guard.state.name().into(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core(max: usize) -> StreamCore {
        StreamCore::new(
            StreamInfo {
                id: 0,
                set_id: None,
                width: 640,
                height: 480,
                format: PixelFormat::Nv12,
                dataspace: 0,
                rotation: Rotation::None,
                usage: BufferUsage::HW_CAMERA_WRITE,
                max_buffers: max,
            },
            StreamKind::Output,
        )
    }

    fn configure(core: &StreamCore) {
        let cfg = core.start_configuration().unwrap();
        core.finish_configuration(&cfg).unwrap();
    }

    #[test]
    fn two_phase_configuration_transitions() {
        let c = core(2);
        assert_eq!(c.state(), StreamState::Constructed);
        let cfg = c.start_configuration().unwrap();
        assert_eq!(c.state(), StreamState::InConfig);
        c.finish_configuration(&cfg).unwrap();
        assert_eq!(c.state(), StreamState::Configured);

        // Reconfiguration path.
        c.start_configuration().unwrap();
        assert_eq!(c.state(), StreamState::InReconfig);
        c.cancel_configuration().unwrap();
        assert_eq!(c.state(), StreamState::Configured);
    }

    #[test]
    fn hand_out_cap_enforced() {
        let c = core(2);
        configure(&c);
        c.note_buffer_out().unwrap();
        c.note_buffer_out().unwrap();
        assert!(matches!(
            c.note_buffer_out(),
            Err(CameraError::BufferLimit { stream: 0, max: 2 })
        ));
        c.note_buffer_returned();
        c.note_buffer_out().unwrap();
    }

    #[test]
    fn acquisition_at_cap_waits_for_a_return() {
        use std::sync::Arc;

        let c = Arc::new(core(1));
        configure(&c);
        c.note_buffer_out().unwrap();

        let waiter = Arc::clone(&c);
        let handle = std::thread::spawn(move || {
            waiter.note_buffer_out_timeout(Duration::from_secs(2))
        });
        std::thread::sleep(Duration::from_millis(20));
        c.note_buffer_returned();
        handle.join().unwrap().unwrap();
        assert_eq!(c.outstanding(), 1);
    }

    #[test]
    fn acquisition_at_cap_times_out_without_a_return() {
        let c = core(1);
        configure(&c);
        c.note_buffer_out().unwrap();
        assert!(matches!(
            c.note_buffer_out_timeout(Duration::from_millis(20)),
            Err(CameraError::Timeout { .. })
        ));
        assert_eq!(c.outstanding(), 1);
    }

    #[test]
    fn disconnect_refuses_with_outstanding_then_is_idempotent() {
        let c = core(1);
        configure(&c);
        c.note_buffer_out().unwrap();
        assert!(matches!(
            c.begin_disconnect(),
            Err(CameraError::BuffersOutstanding { .. })
        ));
        c.note_buffer_returned();
        assert!(c.begin_disconnect().unwrap());
        assert!(!c.begin_disconnect().unwrap());
    }

    #[test]
    fn wait_until_idle_times_out_while_buffers_out() {
        let c = core(1);
        configure(&c);
        c.note_buffer_out().unwrap();
        assert!(c.wait_until_idle(Duration::from_millis(20)).is_err());
        c.note_buffer_returned();
        c.wait_until_idle(Duration::from_millis(20)).unwrap();
    }
}
