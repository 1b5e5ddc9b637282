//! Dedicated worker draining the request queue into the hardware
//!
//! One thread owns request submission: it drains the explicit queue,
//! re-seeds it atomically from the repeating list when empty, assigns
//! strictly increasing frame numbers at dequeue, mixes in one-shot
//! triggers, acquires buffers, registers in-flight entries and submits
//! batches to the hardware in frame order.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::device::DeviceCore;
use crate::error::{CameraError, Result};
use crate::hal::{BufferStatus, FrameNumber, HalErrorKind, HalRequest, StreamBuffer};
use crate::metadata::tags;
use crate::request::{apply_triggers, CaptureRequest, ResultExtras, Trigger};

struct QueuedRequest {
    request: CaptureRequest,
    from_repeating: bool,
}

struct QueueState {
    queue: VecDeque<QueuedRequest>,
    repeating: Vec<CaptureRequest>,
    triggers: Vec<Trigger>,
    next_frame_number: FrameNumber,
    /// Caller- or device-requested pause; checked at loop top.
    do_pause: bool,
    /// Worker has acknowledged the pause (drained to no work).
    paused: bool,
    /// Idle because no work arrived within the starvation window;
    /// distinct from an explicit pause so reconfiguration logic can tell
    /// the difference.
    starved: bool,
    exit: bool,
    repeating_last_frame: Option<FrameNumber>,
}

struct LatestState {
    request_id: Option<i32>,
}

/// State shared between the worker thread, the device and public waiters.
pub(crate) struct RequestShared {
    state: Mutex<QueueState>,
    cond: Condvar,
    /// Latest-submitted-id waiters deliberately do not contend with the
    /// request queue lock.
    latest: Mutex<LatestState>,
    latest_cond: Condvar,
    /// Serializes `flush()` against an in-progress batch submission.
    flush_lock: Mutex<()>,
}

impl RequestShared {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                repeating: Vec::new(),
                triggers: Vec::new(),
                next_frame_number: 0,
                do_pause: false,
                paused: false,
                starved: false,
                exit: false,
                repeating_last_frame: None,
            }),
            cond: Condvar::new(),
            latest: Mutex::new(LatestState { request_id: None }),
            latest_cond: Condvar::new(),
            flush_lock: Mutex::new(()),
        }
    }

    pub(crate) fn queue_requests(&self, requests: Vec<CaptureRequest>) {
        let mut state = self.state.lock().unwrap();
        for request in requests {
            state.queue.push_back(QueuedRequest {
                request,
                from_repeating: false,
            });
        }
        self.cond.notify_all();
    }

    pub(crate) fn set_repeating(&self, requests: Vec<CaptureRequest>) {
        let mut state = self.state.lock().unwrap();
        state.repeating = requests;
        self.cond.notify_all();
    }

    /// Stop re-seeding from the repeating list. Returns the frame number
    /// of the last repeating request submitted, if any.
    pub(crate) fn clear_repeating(&self) -> Option<FrameNumber> {
        let mut state = self.state.lock().unwrap();
        state.repeating.clear();
        // Drop reseeded-but-unsubmitted repeating clones as well.
        state.queue.retain(|q| !q.from_repeating);
        state.repeating_last_frame
    }

    pub(crate) fn repeating_targets(&self) -> Vec<crate::stream::StreamId> {
        let state = self.state.lock().unwrap();
        state
            .repeating
            .iter()
            .flat_map(|r| r.output_streams.iter().copied())
            .collect()
    }

    pub(crate) fn queue_trigger(&self, trigger: Trigger) {
        let mut state = self.state.lock().unwrap();
        state.triggers.push(trigger);
        self.cond.notify_all();
    }

    /// Put drained triggers back at the head of the list after the
    /// request carrying them aborted; they ride the next submission.
    fn requeue_triggers(&self, triggers: Vec<Trigger>) {
        let mut state = self.state.lock().unwrap();
        let tail = std::mem::take(&mut state.triggers);
        state.triggers = triggers;
        state.triggers.extend(tail);
    }

    pub(crate) fn set_paused(&self, pause: bool) {
        let mut state = self.state.lock().unwrap();
        state.do_pause = pause;
        self.cond.notify_all();
    }

    pub(crate) fn set_exit(&self) {
        let mut state = self.state.lock().unwrap();
        state.exit = true;
        self.cond.notify_all();
        self.latest_cond.notify_all();
    }

    /// Clear both the explicit queue and the repeating list, returning
    /// the queued requests that never reached the hardware so errors can
    /// be synthesized for them.
    pub(crate) fn drain_for_flush(&self) -> Vec<CaptureRequest> {
        let mut state = self.state.lock().unwrap();
        state.repeating.clear();
        state.queue.drain(..).map(|q| q.request).collect()
    }

    /// Block until the worker has submitted a request with this id.
    pub(crate) fn wait_for_request_submitted(&self, request_id: i32, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut latest = self.latest.lock().unwrap();
        while latest.request_id != Some(request_id) {
            let now = Instant::now();
            if now >= deadline {
                return Err(CameraError::Timeout {
                    what: "request submission",
                    after: timeout,
                });
            }
            let (guard, _) = self.latest_cond.wait_timeout(latest, deadline - now).unwrap();
            latest = guard;
        }
        Ok(())
    }

    fn note_submitted(&self, request_id: i32, frame: FrameNumber, from_repeating: bool) {
        if from_repeating {
            let mut state = self.state.lock().unwrap();
            state.repeating_last_frame = Some(frame);
        }
        let mut latest = self.latest.lock().unwrap();
        latest.request_id = Some(request_id);
        self.latest_cond.notify_all();
    }

    pub(crate) fn flush_guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.flush_lock.lock().unwrap()
    }

    /// Return to the fresh-session state so the device can be
    /// re-initialized after a disconnect.
    pub(crate) fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.queue.clear();
        state.repeating.clear();
        state.triggers.clear();
        state.next_frame_number = 0;
        state.do_pause = false;
        state.paused = false;
        state.starved = false;
        state.exit = false;
        state.repeating_last_frame = None;
        drop(state);
        let mut latest = self.latest.lock().unwrap();
        latest.request_id = None;
    }
}

/// One dequeued request with its assigned frame number and (for the
/// first request of a batch) the triggers to mix in.
struct PreparedRequest {
    request: CaptureRequest,
    frame_number: FrameNumber,
    from_repeating: bool,
    triggers: Vec<Trigger>,
}

impl PreparedRequest {
    fn extras(&self) -> ResultExtras {
        ResultExtras {
            request_id: self.request.request_id,
            frame_number: self.frame_number,
            burst_id: self.request.burst_id,
        }
    }
}

/// Handle to the worker thread; owned by the device.
pub(crate) struct RequestThread {
    shared: Arc<RequestShared>,
    handle: Option<JoinHandle<()>>,
}

impl RequestThread {
    pub(crate) fn start(core: Arc<DeviceCore>, shared: Arc<RequestShared>) -> Result<Self> {
        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("artemis-request".into())
            .spawn(move || run_loop(core, thread_shared))
            .map_err(|e| CameraError::Fatal(format!("failed to spawn request thread: {e}")))?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    pub(crate) fn stop(&mut self) {
        self.shared.set_exit();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("request thread panicked");
            }
        }
    }
}

impl Drop for RequestThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(core: Arc<DeviceCore>, shared: Arc<RequestShared>) {
    info!("request thread running");
    while let Some(batch) = next_batch(&core, &shared) {
        process_batch(&core, &shared, batch);
    }
    info!("request thread exiting");
}

/// Block until work is available, honoring pause and starvation rules.
/// Returns None on exit.
fn next_batch(core: &Arc<DeviceCore>, shared: &Arc<RequestShared>) -> Option<Vec<PreparedRequest>> {
    let starvation = core.config().request_starvation_timeout();
    let mut state = shared.state.lock().unwrap();
    loop {
        if state.exit {
            return None;
        }
        if state.do_pause {
            if !state.paused {
                state.paused = true;
                state.starved = false;
                drop(state);
                debug!("request thread paused");
                core.notify_worker_idle();
                state = shared.state.lock().unwrap();
                continue;
            }
            state = shared.cond.wait(state).unwrap();
            continue;
        }
        if !state.queue.is_empty() {
            let was_idle = state.paused || state.starved;
            state.paused = false;
            state.starved = false;

            let Some(first) = state.queue.pop_front() else {
                continue;
            };
            let batch_size = first.request.batch_size.max(1);
            let triggers: Vec<Trigger> = state.triggers.drain(..).collect();
            let mut batch = Vec::with_capacity(batch_size);
            let frame = state.next_frame_number;
            state.next_frame_number += 1;
            batch.push(PreparedRequest {
                request: first.request,
                frame_number: frame,
                from_repeating: first.from_repeating,
                triggers,
            });
            // Constrained high-speed batches share one submission window.
            while batch.len() < batch_size {
                let Some(next) = state.queue.pop_front() else { break };
                let frame = state.next_frame_number;
                state.next_frame_number += 1;
                batch.push(PreparedRequest {
                    request: next.request,
                    frame_number: frame,
                    from_repeating: next.from_repeating,
                    triggers: Vec::new(),
                });
            }
            drop(state);
            if was_idle {
                core.notify_worker_active();
            }
            return Some(batch);
        }
        if !state.repeating.is_empty() {
            // Re-seed the whole repeating burst under the lock so it can
            // never interleave with a partial repeating set.
            let reseed: Vec<QueuedRequest> = state
                .repeating
                .clone()
                .into_iter()
                .map(|request| QueuedRequest {
                    request,
                    from_repeating: true,
                })
                .collect();
            state.queue.extend(reseed);
            continue;
        }
        let (guard, timed_out) = shared.cond.wait_timeout(state, starvation).unwrap();
        state = guard;
        if timed_out.timed_out()
            && state.queue.is_empty()
            && state.repeating.is_empty()
            && !state.starved
            && !state.paused
        {
            state.starved = true;
            drop(state);
            debug!("request thread idle, no work within starvation window");
            core.notify_worker_idle();
            state = shared.state.lock().unwrap();
        }
    }
}

fn process_batch(core: &Arc<DeviceCore>, shared: &Arc<RequestShared>, batch: Vec<PreparedRequest>) {
    let acquire_timeout = core.config().buffer_acquire_timeout();
    let mut hal_requests: Vec<HalRequest> = Vec::with_capacity(batch.len());
    let mut submitted: Vec<(i32, FrameNumber, bool)> = Vec::with_capacity(batch.len());

    for prepared in batch {
        let extras = prepared.extras();
        match build_hal_request(core, &prepared, acquire_timeout) {
            Ok(hal_request) => {
                let buffer_count =
                    hal_request.output_buffers.len() + usize::from(hal_request.input_buffer.is_some());
                match core.inflight.register(extras, buffer_count, hal_request.input_buffer.is_some())
                {
                    Ok(was_empty) => {
                        if was_empty {
                            core.notify_inflight_active();
                        }
                    }
                    Err(e) => {
                        core.set_fatal(format!("in-flight registration failed: {e}"));
                        return;
                    }
                }
                submitted.push((
                    prepared.request.request_id,
                    prepared.frame_number,
                    prepared.from_repeating,
                ));
                hal_requests.push(hal_request);
            }
            Err(e) => {
                // Transient: this request is aborted, the worker keeps
                // going.
                warn!(
                    frame = prepared.frame_number,
                    request_id = prepared.request.request_id,
                    error = %e,
                    "aborting request"
                );
                if !prepared.triggers.is_empty() {
                    shared.requeue_triggers(prepared.triggers);
                }
                core.notify_listener_error(HalErrorKind::Request, extras);
            }
        }
    }

    if hal_requests.is_empty() {
        return;
    }

    // A flush may not race a batch mid-submission.
    let _flush = shared.flush_guard();
    match core.hal().process_capture_request(hal_requests) {
        Ok(()) => {
            for (request_id, frame, from_repeating) in submitted {
                shared.note_submitted(request_id, frame, from_repeating);
            }
        }
        Err(e) => {
            core.set_fatal(format!("HAL rejected capture request batch: {e}"));
        }
    }
}

/// Acquire the buffers for one request and assemble its HAL submission.
/// Any failure returns every partially acquired buffer (errored) to its
/// stream before propagating.
fn build_hal_request(
    core: &Arc<DeviceCore>,
    prepared: &PreparedRequest,
    acquire_timeout: Duration,
) -> Result<HalRequest> {
    let mut settings = prepared.request.settings.clone();
    apply_triggers(&mut settings, &prepared.triggers);
    settings.set_i32(tags::REQUEST_ID, prepared.request.request_id);

    let mut input_buffer: Option<StreamBuffer> = None;
    let mut output_buffers: Vec<StreamBuffer> = Vec::with_capacity(prepared.request.output_streams.len());

    let result = (|| -> Result<()> {
        if let Some(input_id) = prepared.request.input_stream {
            let stream = core
                .stream_by_id(input_id)
                .ok_or(CameraError::BadStreamId(input_id))?;
            input_buffer = Some(stream.acquire_input_buffer(acquire_timeout)?);
        }
        for stream_id in &prepared.request.output_streams {
            let stream = core
                .stream_by_id(*stream_id)
                .ok_or(CameraError::BadStreamId(*stream_id))?;
            output_buffers.push(stream.get_buffer(acquire_timeout)?);
        }
        Ok(())
    })();

    if let Err(e) = result {
        for mut buffer in output_buffers.drain(..) {
            buffer.status = BufferStatus::Error;
            if let Some(stream) = core.stream_by_id(buffer.stream_id) {
                if let Err(ret) = stream.return_buffer(buffer, 0) {
                    warn!(error = %ret, "returning errored buffer during abort failed");
                }
            }
        }
        if let Some(input) = input_buffer.take() {
            if let Some(stream) = core.stream_by_id(input.stream_id) {
                if let Err(ret) = stream.release_input_buffer(input) {
                    warn!(error = %ret, "releasing input buffer during abort failed");
                }
            }
        }
        return Err(e);
    }

    Ok(HalRequest {
        frame_number: prepared.frame_number,
        settings,
        input_buffer,
        output_buffers,
    })
}
