//! Output stream: hardware-filled buffers headed to a downstream consumer

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::buffer::{BufferManager, GraphicBuffer, SetId, StreamBufferInfo};
use crate::error::{CameraError, Result};
use crate::hal::{BufferStatus, HalStreamConfig, StreamBuffer, StreamKind};
use crate::stream::consumer::BufferConsumer;
use crate::stream::{StreamCore, StreamId, StreamInfo, StreamInterface, StreamState};

/// One output channel. Buffers are either dequeued directly from the
/// downstream consumer or, when the stream belongs to a buffer set,
/// supplied by the shared [`BufferManager`] and attached to the consumer.
pub struct OutputStream {
    core: StreamCore,
    consumer: Arc<dyn BufferConsumer>,
    manager: Option<Arc<BufferManager>>,
    registered: Mutex<bool>,
}

impl OutputStream {
    /// Consumer-backed output stream.
    pub fn new(info: StreamInfo, consumer: Arc<dyn BufferConsumer>) -> Self {
        Self {
            core: StreamCore::new(info, StreamKind::Output),
            consumer,
            manager: None,
            registered: Mutex::new(false),
        }
    }

    /// Buffer-manager-backed output stream; `info.set_id` names the
    /// sharing group.
    pub fn with_buffer_manager(
        info: StreamInfo,
        consumer: Arc<dyn BufferConsumer>,
        manager: Arc<BufferManager>,
    ) -> Result<Self> {
        if info.set_id.is_none() {
            return Err(CameraError::BadParameter(
                "buffer-manager-backed stream needs a set id".into(),
            ));
        }
        Ok(Self {
            core: StreamCore::new(info, StreamKind::Output),
            consumer,
            manager: Some(manager),
            registered: Mutex::new(false),
        })
    }

    fn manager_set(&self) -> Option<(Arc<BufferManager>, SetId)> {
        match (&self.manager, self.core.set_id()) {
            (Some(mgr), Some(set)) => Some((Arc::clone(mgr), set)),
            _ => None,
        }
    }

    /// The downstream consumer released a queued buffer; hand it back to
    /// the shared pool. No-op for consumer-backed streams.
    pub fn on_buffer_released(&self, buffer: GraphicBuffer) {
        if let Some((mgr, set)) = self.manager_set() {
            mgr.return_buffer_for_stream(self.core.id(), set, buffer);
        }
    }
}

impl StreamInterface for OutputStream {
    fn id(&self) -> StreamId {
        self.core.id()
    }

    fn set_id(&self) -> Option<SetId> {
        self.core.set_id()
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
        self.core.finish_configuration(config)?;
        self.consumer.set_buffer_count(config.max_buffers)?;
        if let Some((mgr, set)) = self.manager_set() {
            let mut registered = self.registered.lock().unwrap();
            let info = self.core.info();
            let buffer_info = StreamBufferInfo {
                width: info.width,
                height: info.height,
                format: info.format,
                usage: info.usage,
                total_buffer_count: info.max_buffers,
            };
            if *registered {
                // A reconfiguration may renegotiate max_buffers; the set's
                // water mark must follow.
                mgr.update_stream(info.id, set, buffer_info)?;
            } else {
                mgr.register_stream(info.id, set, buffer_info)?;
                *registered = true;
            }
        }
        Ok(())
    }

    fn cancel_configuration(&self) -> Result<()> {
        self.core.cancel_configuration()
    }

    fn get_buffer(&self, timeout: Duration) -> Result<StreamBuffer> {
        self.core.note_buffer_out_timeout(timeout)?;
        let acquired = match self.manager_set() {
            Some((mgr, set)) => mgr
                .get_buffer_for_stream(self.core.id(), set)
                .and_then(|buffer| {
                    if let Err(e) = self.consumer.attach_buffer(buffer.clone()) {
                        mgr.return_buffer_for_stream(self.core.id(), set, buffer);
                        return Err(e);
                    }
                    Ok(buffer)
                }),
            None => self.consumer.dequeue_buffer(timeout),
        };
        match acquired {
            Ok(buffer) => Ok(StreamBuffer {
                stream_id: self.core.id(),
                buffer,
                status: BufferStatus::Ok,
            }),
            Err(e) => {
                self.core.revert_buffer_out();
                Err(e)
            }
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
        let result = match buffer.status {
            BufferStatus::Ok => self.consumer.queue_buffer(buffer.buffer, timestamp),
            BufferStatus::Error => {
                // Never present an errored buffer; cancel it back, and for
                // pool-backed streams give the capacity back to the set.
                let cancelled = self.consumer.cancel_buffer(buffer.buffer);
                if let Some((mgr, set)) = self.manager_set() {
                    match self.consumer.detach_buffer() {
                        Ok(Some(detached)) => {
                            mgr.return_buffer_for_stream(self.core.id(), set, detached)
                        }
                        Ok(None) => {}
                        Err(e) => warn!(stream_id = self.core.id(), error = %e, "detach after cancel failed"),
                    }
                }
                cancelled
            }
        };
        self.core.note_buffer_returned();
        result
    }

    fn outstanding_buffers(&self) -> usize {
        self.core.outstanding()
    }

    fn wait_until_idle(&self, timeout: Duration) -> Result<()> {
        self.core.wait_until_idle(timeout)
    }

    fn prepare(&self, max_count: usize) -> Result<()> {
        self.core.ensure_configured("prepare")?;
        if self.manager.is_some() {
            return Err(CameraError::BadParameter(
                "prepare not supported on buffer-manager-backed streams".into(),
            ));
        }
        if self.core.outstanding() > 0 {
            return Err(CameraError::InvalidState {
                op: "prepare",
                state: "buffers outstanding".into(),
            });
        }
        let target = max_count.min(self.core.info().max_buffers);
        let mut held = Vec::with_capacity(target);
        // Force the consumer to allocate by cycling buffers through it.
        let result = (0..target).try_for_each(|_| {
            self.consumer
                .dequeue_buffer(Duration::from_millis(0))
                .map(|b| held.push(b))
        });
        for buffer in held {
            if let Err(e) = self.consumer.cancel_buffer(buffer) {
                warn!(stream_id = self.core.id(), error = %e, "cancel during prepare failed");
            }
        }
        result?;
        debug!(stream_id = self.core.id(), count = target, "stream prepared");
        Ok(())
    }

    fn tear_down(&self) -> Result<()> {
        self.core.ensure_configured("tear_down")?;
        if self.manager.is_some() {
            return Ok(());
        }
        let mut dropped = 0usize;
        while self.consumer.detach_buffer()?.is_some() {
            dropped += 1;
        }
        debug!(stream_id = self.core.id(), dropped, "stream buffers torn down");
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        if !self.core.begin_disconnect()? {
            return Ok(());
        }
        if let Some((mgr, set)) = self.manager_set() {
            let mut registered = self.registered.lock().unwrap();
            if *registered {
                if let Err(e) = mgr.unregister_stream(self.core.id(), set) {
                    warn!(stream_id = self.core.id(), error = %e, "unregister from buffer manager failed");
                }
                *registered = false;
            }
        }
        if let Err(e) = self.consumer.disconnect() {
            warn!(stream_id = self.core.id(), error = %e, "consumer disconnect failed");
        }
        debug!(stream_id = self.core.id(), "output stream disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferUsage, PixelFormat};
    use crate::stream::consumer::FifoQueue;
    use crate::stream::Rotation;

    fn info(id: StreamId, set_id: Option<SetId>, max: usize) -> StreamInfo {
        StreamInfo {
            id,
            set_id,
            width: 640,
            height: 480,
            format: PixelFormat::Nv12,
            dataspace: 0,
            rotation: Rotation::None,
            usage: BufferUsage::HW_CAMERA_WRITE,
            max_buffers: max,
        }
    }

    fn consumer(max: usize) -> Arc<FifoQueue> {
        Arc::new(FifoQueue::new(
            640,
            480,
            PixelFormat::Nv12,
            BufferUsage::HW_CAMERA_WRITE,
            max,
        ))
    }

    fn configure(stream: &OutputStream) {
        let cfg = stream.start_configuration().unwrap();
        stream.finish_configuration(&cfg).unwrap();
    }

    #[test]
    fn returned_ok_buffer_is_queued_with_timestamp() {
        let fifo = consumer(2);
        let stream = OutputStream::new(info(0, None, 2), Arc::clone(&fifo) as _);
        configure(&stream);

        let sb = stream.get_buffer(Duration::from_millis(10)).unwrap();
        assert_eq!(stream.outstanding_buffers(), 1);
        stream.return_buffer(sb, 12345).unwrap();
        assert_eq!(stream.outstanding_buffers(), 0);

        let (_, ts) = fifo.acquire().unwrap();
        assert_eq!(ts, 12345);
    }

    #[test]
    fn errored_buffer_is_cancelled_not_presented() {
        let fifo = consumer(2);
        let stream = OutputStream::new(info(0, None, 2), Arc::clone(&fifo) as _);
        configure(&stream);

        let mut sb = stream.get_buffer(Duration::from_millis(10)).unwrap();
        sb.status = BufferStatus::Error;
        stream.return_buffer(sb, 0).unwrap();
        assert_eq!(fifo.queued_len(), 0);
    }

    #[test]
    fn manager_backed_stream_draws_from_pool() {
        let fifo = consumer(4);
        let manager = Arc::new(BufferManager::new());
        let stream = OutputStream::with_buffer_manager(
            info(3, Some(1), 2),
            Arc::clone(&fifo) as _,
            Arc::clone(&manager),
        )
        .unwrap();
        configure(&stream);

        let sb = stream.get_buffer(Duration::from_millis(10)).unwrap();
        assert_eq!(manager.handed_out_count(3, 1), 1);
        stream.return_buffer(sb, 99).unwrap();
        // Pool capacity comes back when the consumer releases the buffer.
        let (released, _) = fifo.acquire().unwrap();
        stream.on_buffer_released(released);
        assert_eq!(manager.handed_out_count(3, 1), 0);
    }

    #[test]
    fn reconfiguration_refreshes_pool_registration() {
        let fifo = consumer(8);
        let manager = Arc::new(BufferManager::new());
        let stream = OutputStream::with_buffer_manager(
            info(3, Some(1), 2),
            Arc::clone(&fifo) as _,
            Arc::clone(&manager),
        )
        .unwrap();
        configure(&stream);
        assert_eq!(manager.set_stats(1).unwrap().2, 2);

        // Renegotiate a larger buffer count; the set's water mark follows.
        let mut cfg = stream.start_configuration().unwrap();
        cfg.max_buffers = 5;
        stream.finish_configuration(&cfg).unwrap();
        assert_eq!(manager.set_stats(1).unwrap().2, 5);
    }

    #[test]
    fn prepare_allocates_then_returns_all() {
        let fifo = consumer(3);
        let stream = OutputStream::new(info(0, None, 3), Arc::clone(&fifo) as _);
        configure(&stream);
        stream.prepare(3).unwrap();
        assert_eq!(stream.outstanding_buffers(), 0);
        // All three buffers exist and are immediately dequeueable.
        let a = stream.get_buffer(Duration::from_millis(0)).unwrap();
        let b = stream.get_buffer(Duration::from_millis(0)).unwrap();
        let c = stream.get_buffer(Duration::from_millis(0)).unwrap();
        for sb in [a, b, c] {
            stream.return_buffer(sb, 0).unwrap();
        }
    }

    #[test]
    fn disconnect_is_idempotent() {
        let fifo = consumer(1);
        let stream = OutputStream::new(info(0, None, 1), Arc::clone(&fifo) as _);
        configure(&stream);
        stream.disconnect().unwrap();
        stream.disconnect().unwrap();
        assert_eq!(stream.state(), StreamState::Abandoned);
    }
}
