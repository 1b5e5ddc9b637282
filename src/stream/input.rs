//! Input stream: reprocessing buffers pulled from an upstream producer

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::buffer::{GraphicBuffer, SetId};
use crate::error::{CameraError, Result};
use crate::hal::{BufferStatus, HalStreamConfig, StreamBuffer, StreamKind};
use crate::stream::consumer::BufferProducer;
use crate::stream::{StreamCore, StreamId, StreamInfo, StreamInterface, StreamState};

/// One input channel feeding previously captured buffers back to the
/// hardware. Several buffers may be outstanding at once; they are tracked
/// by identity and unregistered by identity match on return.
pub struct InputStream {
    core: StreamCore,
    producer: Arc<dyn BufferProducer>,
    in_flight: Mutex<Vec<GraphicBuffer>>,
}

impl InputStream {
    pub fn new(info: StreamInfo, producer: Arc<dyn BufferProducer>) -> Self {
        Self {
            core: StreamCore::new(info, StreamKind::Input),
            producer,
            in_flight: Mutex::new(Vec::new()),
        }
    }
}

impl StreamInterface for InputStream {
    fn id(&self) -> StreamId {
        self.core.id()
    }

    fn set_id(&self) -> Option<SetId> {
        self.core.set_id()
    }

    fn kind(&self) -> StreamKind {
        StreamKind::Input
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
        Err(CameraError::InvalidState {
            op: "get_buffer",
            state: format!("stream {} is input-only", self.core.id()),
        })
    }

    fn return_buffer(&self, _buffer: StreamBuffer, _timestamp: i64) -> Result<()> {
        Err(CameraError::InvalidState {
            op: "return_buffer",
            state: format!("stream {} is input-only", self.core.id()),
        })
    }

    fn acquire_input_buffer(&self, timeout: Duration) -> Result<StreamBuffer> {
        self.core.note_buffer_out()?;
        match self.producer.acquire_buffer(timeout) {
            Ok((buffer, timestamp)) => {
                debug!(
                    stream_id = self.core.id(),
                    buffer_id = buffer.id(),
                    timestamp,
                    "acquired input buffer"
                );
                self.in_flight.lock().unwrap().push(buffer.clone());
                Ok(StreamBuffer {
                    stream_id: self.core.id(),
                    buffer,
                    status: BufferStatus::Ok,
                })
            }
            Err(e) => {
                self.core.revert_buffer_out();
                Err(e)
            }
        }
    }

    fn release_input_buffer(&self, buffer: StreamBuffer) -> Result<()> {
        let mut in_flight = self.in_flight.lock().unwrap();
        // Outstanding buffers are matched by identity, not position.
        let idx = in_flight
            .iter()
            .position(|b| b.id() == buffer.buffer.id())
            .ok_or_else(|| {
                CameraError::BadParameter(format!(
                    "buffer {} is not in flight on stream {}",
                    buffer.buffer.id(),
                    self.core.id()
                ))
            })?;
        let tracked = in_flight.swap_remove(idx);
        drop(in_flight);
        self.producer.release_buffer(tracked)?;
        self.core.note_buffer_returned();
        Ok(())
    }

    fn outstanding_buffers(&self) -> usize {
        self.core.outstanding()
    }

    fn wait_until_idle(&self, timeout: Duration) -> Result<()> {
        self.core.wait_until_idle(timeout)
    }

    fn disconnect(&self) -> Result<()> {
        if self.core.begin_disconnect()? {
            debug!(stream_id = self.core.id(), "input stream disconnected");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferUsage, PixelFormat};
    use crate::stream::consumer::{BufferConsumer, FifoQueue};
    use crate::stream::Rotation;

    fn stream_with_producer(depth: usize) -> (InputStream, Arc<FifoQueue>) {
        let fifo = Arc::new(FifoQueue::new(
            640,
            480,
            PixelFormat::RawOpaque,
            BufferUsage::HW_CAMERA_READ,
            depth,
        ));
        let stream = InputStream::new(
            StreamInfo {
                id: 10,
                set_id: None,
                width: 640,
                height: 480,
                format: PixelFormat::RawOpaque,
                dataspace: 0,
                rotation: Rotation::None,
                usage: BufferUsage::HW_CAMERA_READ,
                max_buffers: depth,
            },
            Arc::clone(&fifo) as _,
        );
        let cfg = stream.start_configuration().unwrap();
        stream.finish_configuration(&cfg).unwrap();
        (stream, fifo)
    }

    fn produce(fifo: &FifoQueue, timestamp: i64) {
        let buf = fifo.dequeue_buffer(Duration::from_millis(10)).unwrap();
        fifo.queue_buffer(buf, timestamp).unwrap();
    }

    #[test]
    fn release_matches_by_identity_not_order() {
        let (stream, fifo) = stream_with_producer(3);
        produce(&fifo, 1);
        produce(&fifo, 2);
        produce(&fifo, 3);

        let a = stream.acquire_input_buffer(Duration::from_millis(10)).unwrap();
        let b = stream.acquire_input_buffer(Duration::from_millis(10)).unwrap();
        let c = stream.acquire_input_buffer(Duration::from_millis(10)).unwrap();
        assert_eq!(stream.outstanding_buffers(), 3);

        // Return out of acquisition order.
        stream.release_input_buffer(b).unwrap();
        stream.release_input_buffer(a).unwrap();
        stream.release_input_buffer(c).unwrap();
        assert_eq!(stream.outstanding_buffers(), 0);
    }

    #[test]
    fn releasing_unknown_buffer_is_rejected_with_no_accounting_change() {
        let (stream, fifo) = stream_with_producer(2);
        produce(&fifo, 1);
        let a = stream.acquire_input_buffer(Duration::from_millis(10)).unwrap();

        let foreign = StreamBuffer {
            stream_id: 10,
            buffer: GraphicBuffer::allocate(
                640,
                480,
                PixelFormat::RawOpaque,
                BufferUsage::HW_CAMERA_READ,
            ),
            status: BufferStatus::Ok,
        };
        assert!(stream.release_input_buffer(foreign).is_err());
        assert_eq!(stream.outstanding_buffers(), 1);
        stream.release_input_buffer(a).unwrap();
    }

    #[test]
    fn acquire_with_empty_producer_times_out_cleanly() {
        let (stream, _fifo) = stream_with_producer(2);
        assert!(matches!(
            stream.acquire_input_buffer(Duration::from_millis(10)),
            Err(CameraError::Timeout { .. })
        ));
        assert_eq!(stream.outstanding_buffers(), 0);
    }
}
