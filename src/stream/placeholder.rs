//! Placeholder stream: keeps a zero-stream configuration legal
//!
//! The hardware contract forbids configuring zero streams. When the caller
//! has deleted every real stream the device inserts one of these; it is
//! removed transparently once a real stream exists. All buffer operations
//! fail loudly; nothing should ever target it.

use std::time::Duration;

use tracing::error;

use crate::buffer::{BufferUsage, PixelFormat, SetId};
use crate::error::{CameraError, Result};
use crate::hal::{HalStreamConfig, StreamBuffer, StreamKind};
use crate::stream::{Rotation, StreamCore, StreamId, StreamInfo, StreamInterface, StreamState};

const PLACEHOLDER_WIDTH: u32 = 320;
const PLACEHOLDER_HEIGHT: u32 = 240;

pub struct PlaceholderStream {
    core: StreamCore,
}

impl PlaceholderStream {
    pub fn new(id: StreamId) -> Self {
        Self {
            core: StreamCore::new(
                StreamInfo {
                    id,
                    set_id: None,
                    width: PLACEHOLDER_WIDTH,
                    height: PLACEHOLDER_HEIGHT,
                    format: PixelFormat::Nv12,
                    dataspace: 0,
                    rotation: Rotation::None,
                    usage: BufferUsage::HW_CAMERA_WRITE,
                    max_buffers: 1,
                },
                StreamKind::Output,
            ),
        }
    }
}

impl StreamInterface for PlaceholderStream {
    fn id(&self) -> StreamId {
        self.core.id()
    }

    fn set_id(&self) -> Option<SetId> {
        None
    }

    fn kind(&self) -> StreamKind {
        StreamKind::Output
    }

    fn info(&self) -> StreamInfo {
        self.core.info()
    }

    fn state(&self) -> StreamState {
        self.core.state()
    }

    fn start_configuration(&self) -> Result<HalStreamConfig> {
        self.core.start_configuration()
    }

    fn finish_configuration(&self, config: &HalStreamConfig) -> Result<()> {
        self.core.finish_configuration(config)
    }

    fn cancel_configuration(&self) -> Result<()> {
        self.core.cancel_configuration()
    }

    fn get_buffer(&self, _timeout: Duration) -> Result<StreamBuffer> {
        error!(stream_id = self.core.id(), "get_buffer called on placeholder stream");
        Err(CameraError::InvalidState {
            op: "get_buffer",
            state: "placeholder stream".into(),
        })
    }

    fn return_buffer(&self, _buffer: StreamBuffer, _timestamp: i64) -> Result<()> {
        error!(stream_id = self.core.id(), "return_buffer called on placeholder stream");
        Err(CameraError::InvalidState {
            op: "return_buffer",
            state: "placeholder stream".into(),
        })
    }

    fn outstanding_buffers(&self) -> usize {
        0
    }

    fn wait_until_idle(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        self.core.begin_disconnect()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_operations_fail_loudly() {
        let stream = PlaceholderStream::new(42);
        let cfg = stream.start_configuration().unwrap();
        stream.finish_configuration(&cfg).unwrap();
        assert!(stream.get_buffer(Duration::from_millis(1)).is_err());
        assert!(stream.wait_until_idle(Duration::from_millis(1)).is_ok());
        stream.disconnect().unwrap();
    }
}
