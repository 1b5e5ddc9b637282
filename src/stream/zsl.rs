//! Bidirectional (ZSL) stream: a ring of recent captures for reprocessing

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::buffer::{GraphicBuffer, SetId};
use crate::error::{CameraError, Result};
use crate::hal::{BufferStatus, HalStreamConfig, StreamBuffer, StreamKind};
use crate::stream::{StreamCore, StreamId, StreamInfo, StreamInterface, StreamState};

struct ZslInner {
    free: Vec<GraphicBuffer>,
    /// Recently produced buffers, oldest first, with capture timestamps.
    ring: VecDeque<(GraphicBuffer, i64)>,
    /// Buffers pinned for hardware-side reprocessing.
    pinned: Vec<GraphicBuffer>,
    created: usize,
}

/// Zero-shutter-lag stream. As an output it fills a fixed-depth ring of
/// recent buffers; as an input it pins the ring entry whose capture
/// timestamp best matches a requested one and hands it back to the
/// hardware for reprocessing.
pub struct ZslStream {
    core: StreamCore,
    depth: usize,
    inner: Mutex<ZslInner>,
    cond: Condvar,
}

impl ZslStream {
    pub fn new(info: StreamInfo, depth: usize) -> Self {
        Self {
            core: StreamCore::new(info, StreamKind::Bidirectional),
            depth,
            inner: Mutex::new(ZslInner {
                free: Vec::new(),
                ring: VecDeque::new(),
                pinned: Vec::new(),
                created: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Number of captures currently parked in the ring.
    pub fn ring_len(&self) -> usize {
        self.inner.lock().unwrap().ring.len()
    }

    /// Pin the ring buffer whose timestamp best matches `timestamp`:
    /// exact match preferred, else nearest earlier, else nearest later.
    /// Returns the pinned buffer and its actual capture timestamp.
    pub fn pin_buffer(&self, timestamp: i64) -> Result<(StreamBuffer, i64)> {
        self.core.ensure_configured("pin_buffer")?;
        self.core.note_buffer_out()?;
        let mut inner = self.inner.lock().unwrap();
        let idx = Self::best_match(&inner.ring, timestamp);
        let Some(idx) = idx else {
            drop(inner);
            self.core.revert_buffer_out();
            return Err(CameraError::BadParameter(format!(
                "no ZSL capture available near timestamp {timestamp}"
            )));
        };
        let Some((buffer, actual)) = inner.ring.remove(idx) else {
            drop(inner);
            self.core.revert_buffer_out();
            return Err(CameraError::BadParameter(format!(
                "no ZSL capture available near timestamp {timestamp}"
            )));
        };
        inner.pinned.push(buffer.clone());
        debug!(
            stream_id = self.core.id(),
            requested = timestamp,
            actual,
            "pinned ZSL buffer"
        );
        Ok((
            StreamBuffer {
                stream_id: self.core.id(),
                buffer,
                status: BufferStatus::Ok,
            },
            actual,
        ))
    }

    fn best_match(ring: &VecDeque<(GraphicBuffer, i64)>, timestamp: i64) -> Option<usize> {
        if let Some(idx) = ring.iter().position(|(_, ts)| *ts == timestamp) {
            return Some(idx);
        }
        // Nearest earlier, i.e. the largest timestamp not after the target.
        let earlier = ring
            .iter()
            .enumerate()
            .filter(|(_, (_, ts))| *ts < timestamp)
            .max_by_key(|(_, (_, ts))| *ts)
            .map(|(idx, _)| idx);
        if earlier.is_some() {
            return earlier;
        }
        // Else nearest later.
        ring.iter()
            .enumerate()
            .filter(|(_, (_, ts))| *ts > timestamp)
            .min_by_key(|(_, (_, ts))| *ts)
            .map(|(idx, _)| idx)
    }
}

impl StreamInterface for ZslStream {
    fn id(&self) -> StreamId {
        self.core.id()
    }

    fn set_id(&self) -> Option<SetId> {
        self.core.set_id()
    }

    fn kind(&self) -> StreamKind {
        StreamKind::Bidirectional
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

    fn get_buffer(&self, timeout: Duration) -> Result<StreamBuffer> {
        let deadline = Instant::now() + timeout;
        self.core.note_buffer_out_timeout(timeout)?;
        let budget = self.core.info().max_buffers + self.depth;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(buffer) = inner.free.pop() {
                return Ok(StreamBuffer {
                    stream_id: self.core.id(),
                    buffer,
                    status: BufferStatus::Ok,
                });
            }
            // Recycle the oldest unpinned capture before allocating.
            if let Some((buffer, _)) = inner.ring.pop_front() {
                return Ok(StreamBuffer {
                    stream_id: self.core.id(),
                    buffer,
                    status: BufferStatus::Ok,
                });
            }
            if inner.created < budget {
                inner.created += 1;
                let info = self.core.info();
                return Ok(StreamBuffer {
                    stream_id: self.core.id(),
                    buffer: GraphicBuffer::allocate(info.width, info.height, info.format, info.usage),
                    status: BufferStatus::Ok,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                drop(inner);
                self.core.revert_buffer_out();
                return Err(CameraError::Timeout {
                    what: "free ZSL buffer",
                    after: timeout,
                });
            }
            let (guard, _) = self.cond.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
    }

    fn return_buffer(&self, buffer: StreamBuffer, timestamp: i64) -> Result<()> {
        if buffer.stream_id != self.core.id() {
            return Err(CameraError::BadParameter(format!(
                "buffer for stream {} returned to stream {}",
                buffer.stream_id,
                self.core.id()
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        match buffer.status {
            BufferStatus::Ok => {
                inner.ring.push_back((buffer.buffer, timestamp));
                while inner.ring.len() > self.depth {
                    if let Some((evicted, _)) = inner.ring.pop_front() {
                        inner.free.push(evicted);
                    }
                }
            }
            BufferStatus::Error => inner.free.push(buffer.buffer),
        }
        drop(inner);
        self.core.note_buffer_returned();
        self.cond.notify_all();
        Ok(())
    }

    fn acquire_input_buffer(&self, _timeout: Duration) -> Result<StreamBuffer> {
        // Without a target timestamp, reprocess the most recent capture.
        let latest = {
            let inner = self.inner.lock().unwrap();
            inner.ring.back().map(|(_, ts)| *ts)
        };
        let Some(ts) = latest else {
            return Err(CameraError::BadParameter(
                "ZSL ring is empty, nothing to reprocess".into(),
            ));
        };
        self.pin_buffer(ts).map(|(buffer, _)| buffer)
    }

    fn release_input_buffer(&self, buffer: StreamBuffer) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner
            .pinned
            .iter()
            .position(|b| b.id() == buffer.buffer.id())
            .ok_or_else(|| {
                CameraError::BadParameter(format!(
                    "buffer {} is not pinned on stream {}",
                    buffer.buffer.id(),
                    self.core.id()
                ))
            })?;
        let released = inner.pinned.swap_remove(idx);
        inner.free.push(released);
        drop(inner);
        self.core.note_buffer_returned();
        self.cond.notify_all();
        Ok(())
    }

    fn outstanding_buffers(&self) -> usize {
        self.core.outstanding()
    }

    fn wait_until_idle(&self, timeout: Duration) -> Result<()> {
        self.core.wait_until_idle(timeout)
    }

    fn disconnect(&self) -> Result<()> {
        if !self.core.begin_disconnect()? {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();
        inner.ring.clear();
        inner.free.clear();
        inner.created = 0;
        debug!(stream_id = self.core.id(), "ZSL stream disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferUsage, PixelFormat};
    use crate::stream::Rotation;

    fn zsl(depth: usize, max: usize) -> ZslStream {
        let stream = ZslStream::new(
            StreamInfo {
                id: 5,
                set_id: None,
                width: 320,
                height: 240,
                format: PixelFormat::RawOpaque,
                dataspace: 0,
                rotation: Rotation::None,
                usage: BufferUsage::HW_CAMERA_READ | BufferUsage::HW_CAMERA_WRITE,
                max_buffers: max,
            },
            depth,
        );
        let cfg = stream.start_configuration().unwrap();
        stream.finish_configuration(&cfg).unwrap();
        stream
    }

    fn capture(stream: &ZslStream, timestamp: i64) {
        let sb = stream.get_buffer(Duration::from_millis(10)).unwrap();
        stream.return_buffer(sb, timestamp).unwrap();
    }

    #[test]
    fn ring_is_bounded_by_depth() {
        let stream = zsl(3, 2);
        for ts in 1..=5 {
            capture(&stream, ts);
        }
        assert_eq!(stream.ring_len(), 3);
    }

    #[test]
    fn pin_prefers_exact_then_earlier_then_later() {
        let stream = zsl(4, 2);
        for ts in [100, 200, 300] {
            capture(&stream, ts);
        }

        // Exact match.
        let (sb, actual) = stream.pin_buffer(200).unwrap();
        assert_eq!(actual, 200);
        stream.release_input_buffer(sb).unwrap();

        // No exact: nearest earlier (100 for request 250... ring now 100,300).
        let (sb, actual) = stream.pin_buffer(250).unwrap();
        assert_eq!(actual, 100);
        stream.release_input_buffer(sb).unwrap();

        // Ring holds only 100 and 300; request below both pins the later.
        let (sb, actual) = stream.pin_buffer(50).unwrap();
        assert_eq!(actual, 100);
        stream.release_input_buffer(sb).unwrap();
        let (sb, actual) = stream.pin_buffer(99).unwrap();
        assert_eq!(actual, 100);
        stream.release_input_buffer(sb).unwrap();
    }

    #[test]
    fn pinned_buffer_leaves_the_ring() {
        let stream = zsl(2, 2);
        capture(&stream, 10);
        capture(&stream, 20);
        let (sb, _) = stream.pin_buffer(20).unwrap();
        assert_eq!(stream.ring_len(), 1);
        assert_eq!(stream.outstanding_buffers(), 1);
        stream.release_input_buffer(sb).unwrap();
        assert_eq!(stream.outstanding_buffers(), 0);
    }

    #[test]
    fn empty_ring_has_nothing_to_reprocess() {
        let stream = zsl(2, 1);
        assert!(stream.acquire_input_buffer(Duration::from_millis(1)).is_err());
    }
}
