//! Downstream/upstream buffer endpoints consumed by streams
//!
//! The transport semantics of a real graphics buffer queue are out of
//! scope; streams only rely on this small contract. `FifoQueue` is the
//! in-process implementation used by ZSL streams and tests.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::buffer::{BufferUsage, GraphicBuffer, PixelFormat};
use crate::error::{CameraError, Result};

/// Downstream consumer endpoint an output stream pushes buffers into.
pub trait BufferConsumer: Send + Sync {
    /// Negotiate how many buffers the endpoint keeps in rotation.
    fn set_buffer_count(&self, count: usize) -> Result<()>;

    /// Take a free buffer for the producer to fill. Blocks up to `timeout`
    /// waiting for the consumer to release one.
    fn dequeue_buffer(&self, timeout: Duration) -> Result<GraphicBuffer>;

    /// Hand a filled buffer to the consumer with its presentation timestamp.
    fn queue_buffer(&self, buffer: GraphicBuffer, timestamp: i64) -> Result<()>;

    /// Return a dequeued buffer unfilled.
    fn cancel_buffer(&self, buffer: GraphicBuffer) -> Result<()>;

    /// Register an externally allocated buffer as dequeued (buffer-manager
    /// backed streams attach pool buffers instead of dequeuing).
    fn attach_buffer(&self, buffer: GraphicBuffer) -> Result<()>;

    /// Remove one free buffer from the endpoint entirely, if any.
    fn detach_buffer(&self) -> Result<Option<GraphicBuffer>>;

    /// Tear the endpoint down; subsequent ops fail.
    fn disconnect(&self) -> Result<()>;
}

/// Upstream producer endpoint an input stream pulls filled buffers from.
pub trait BufferProducer: Send + Sync {
    /// Acquire the next available filled buffer and its timestamp.
    fn acquire_buffer(&self, timeout: Duration) -> Result<(GraphicBuffer, i64)>;

    /// Give a consumed buffer back to the producer.
    fn release_buffer(&self, buffer: GraphicBuffer) -> Result<()>;
}

struct FifoState {
    free: Vec<GraphicBuffer>,
    queued: VecDeque<(GraphicBuffer, i64)>,
    /// Ids currently dequeued or attached, awaiting queue/cancel.
    outstanding: Vec<u64>,
    capacity: usize,
    created: usize,
    connected: bool,
}

/// In-memory FIFO buffer queue implementing both endpoint contracts.
pub struct FifoQueue {
    width: u32,
    height: u32,
    format: PixelFormat,
    usage: BufferUsage,
    state: Mutex<FifoState>,
    cond: Condvar,
}

impl FifoQueue {
    pub fn new(width: u32, height: u32, format: PixelFormat, usage: BufferUsage, capacity: usize) -> Self {
        Self {
            width,
            height,
            format,
            usage,
            state: Mutex::new(FifoState {
                free: Vec::new(),
                queued: VecDeque::new(),
                outstanding: Vec::new(),
                capacity,
                created: 0,
                connected: true,
            }),
            cond: Condvar::new(),
        }
    }

    /// Number of filled buffers waiting on the consumer side.
    pub fn queued_len(&self) -> usize {
        self.state.lock().unwrap().queued.len()
    }

    /// Consumer side: take the oldest queued buffer for processing.
    pub fn acquire(&self) -> Option<(GraphicBuffer, i64)> {
        self.state.lock().unwrap().queued.pop_front()
    }

    /// Consumer side: hand a processed buffer back into the free pool.
    pub fn release(&self, buffer: GraphicBuffer) {
        let mut state = self.state.lock().unwrap();
        state.free.push(buffer);
        self.cond.notify_all();
    }

    fn check_connected(state: &FifoState) -> Result<()> {
        if state.connected {
            Ok(())
        } else {
            Err(CameraError::Endpoint("queue disconnected".into()))
        }
    }

    fn take_outstanding(state: &mut FifoState, buffer: &GraphicBuffer) -> Result<()> {
        match state.outstanding.iter().position(|id| *id == buffer.id()) {
            Some(idx) => {
                state.outstanding.swap_remove(idx);
                Ok(())
            }
            None => Err(CameraError::Endpoint(format!(
                "buffer {} was not dequeued from this queue",
                buffer.id()
            ))),
        }
    }
}

impl BufferConsumer for FifoQueue {
    fn set_buffer_count(&self, count: usize) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_connected(&state)?;
        if count < state.outstanding.len() {
            return Err(CameraError::BadParameter(format!(
                "buffer count {count} below {} outstanding",
                state.outstanding.len()
            )));
        }
        state.capacity = count;
        Ok(())
    }

    fn dequeue_buffer(&self, timeout: Duration) -> Result<GraphicBuffer> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            Self::check_connected(&state)?;
            if let Some(buffer) = state.free.pop() {
                state.outstanding.push(buffer.id());
                return Ok(buffer);
            }
            if state.created < state.capacity {
                state.created += 1;
                let buffer = GraphicBuffer::allocate(self.width, self.height, self.format, self.usage);
                state.outstanding.push(buffer.id());
                return Ok(buffer);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CameraError::Timeout {
                    what: "free buffer from consumer",
                    after: timeout,
                });
            }
            let (guard, result) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = guard;
            if result.timed_out() && state.free.is_empty() && state.created >= state.capacity {
                return Err(CameraError::Timeout {
                    what: "free buffer from consumer",
                    after: timeout,
                });
            }
        }
    }

    fn queue_buffer(&self, buffer: GraphicBuffer, timestamp: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_connected(&state)?;
        Self::take_outstanding(&mut state, &buffer)?;
        state.queued.push_back((buffer, timestamp));
        Ok(())
    }

    fn cancel_buffer(&self, buffer: GraphicBuffer) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_connected(&state)?;
        Self::take_outstanding(&mut state, &buffer)?;
        state.free.push(buffer);
        self.cond.notify_all();
        Ok(())
    }

    fn attach_buffer(&self, buffer: GraphicBuffer) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_connected(&state)?;
        state.outstanding.push(buffer.id());
        state.created += 1;
        Ok(())
    }

    fn detach_buffer(&self) -> Result<Option<GraphicBuffer>> {
        let mut state = self.state.lock().unwrap();
        Self::check_connected(&state)?;
        let detached = state.free.pop();
        if detached.is_some() && state.created > 0 {
            state.created -= 1;
        }
        Ok(detached)
    }

    fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.connected = false;
        state.free.clear();
        state.queued.clear();
        self.cond.notify_all();
        Ok(())
    }
}

impl BufferProducer for FifoQueue {
    fn acquire_buffer(&self, timeout: Duration) -> Result<(GraphicBuffer, i64)> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            Self::check_connected(&state)?;
            if let Some(entry) = state.queued.pop_front() {
                state.outstanding.push(entry.0.id());
                return Ok(entry);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CameraError::Timeout {
                    what: "filled buffer from producer",
                    after: timeout,
                });
            }
            let (guard, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }

    fn release_buffer(&self, buffer: GraphicBuffer) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_connected(&state)?;
        Self::take_outstanding(&mut state, &buffer)?;
        state.free.push(buffer);
        self.cond.notify_all();
        Ok(())
    }
}
