//! Device session root: state machine, hardware callbacks, capture API
//!
//! Lock ordering, outermost first: the interface lock (serializes
//! structural API calls) is acquired before the state lock (state machine
//! and stream set). The in-flight tracker, the result queue and the
//! latest-submitted-id field each have their own disjoint locks so the
//! hardware callback thread never blocks on worker-side work.

pub(crate) mod inflight;
pub(crate) mod results;
pub(crate) mod status;

pub use results::CaptureResult;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::buffer::{BufferManager, BufferUsage, PixelFormat, SetId};
use crate::error::{CameraError, Result};
use crate::hal::{
    BufferStatus, FrameNumber, HalCaptureResult, HalDeviceInfo, HalErrorKind, HalEvents,
    HalSession, NotifyMsg, RequestTemplate, StreamBuffer, StreamKind,
};
use crate::Config;
use crate::metadata::{af_trigger, precapture_trigger, tags, CameraMetadata};
use crate::request::thread::{RequestShared, RequestThread};
use crate::request::{CaptureRequest, ResultExtras, Trigger};
use crate::stream::{
    BufferConsumer, BufferProducer, InputStream, OutputStream, PlaceholderStream, Rotation,
    StreamId, StreamInfo, StreamInterface, ZslStream,
};

use inflight::{CallbackActions, InFlightTracker};
use results::ResultDispatcher;
use status::{ComponentId, StatusTracker};

/// Externally visible device lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Uninitialized,
    /// Initialized, stream set dirty or empty.
    Unconfigured,
    /// Streams configured, no requests in flight.
    Configured,
    /// Requests flowing.
    Active,
    /// Terminal until `disconnect()`.
    Error,
}

impl DeviceState {
    fn name(self) -> &'static str {
        match self {
            DeviceState::Uninitialized => "uninitialized",
            DeviceState::Unconfigured => "unconfigured",
            DeviceState::Configured => "configured",
            DeviceState::Active => "active",
            DeviceState::Error => "error",
        }
    }
}

/// Upstream notifications this core emits toward the orchestration layer.
pub trait DeviceListener: Send + Sync {
    fn notify_error(&self, kind: HalErrorKind, extras: ResultExtras);
    fn notify_shutter(&self, extras: ResultExtras, timestamp: i64);
    fn notify_idle(&self);
    fn notify_prepared(&self, stream_id: StreamId);
}

struct StateInner {
    state: DeviceState,
    error_cause: Option<String>,
    streams: BTreeMap<StreamId, Arc<dyn StreamInterface>>,
    input_stream_id: Option<StreamId>,
    placeholder_id: Option<StreamId>,
    next_stream_id: StreamId,
    /// Configuration dirty after any stream add/delete; must be
    /// re-applied before the next request is admitted.
    need_config: bool,
    /// Worker paused internally for a structural change; idle transitions
    /// are not reported to the listener while set.
    internal_pause: bool,
    template_cache: HashMap<RequestTemplate, CameraMetadata>,
}

/// Shared core: owned by [`CameraDevice`], also held by the worker thread
/// and handed to the hardware as its callback sink.
pub(crate) struct DeviceCore {
    config: Config,
    hal: Arc<dyn HalSession>,
    state: Mutex<StateInner>,
    pub(crate) inflight: InFlightTracker,
    pub(crate) dispatcher: ResultDispatcher,
    status: StatusTracker,
    worker_component: ComponentId,
    inflight_component: ComponentId,
    listener: Mutex<Option<Arc<dyn DeviceListener>>>,
    buffer_manager: Arc<BufferManager>,
    pub(crate) request: Arc<RequestShared>,
    partial_result_count: AtomicU32,
}

impl DeviceCore {
    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn hal(&self) -> &Arc<dyn HalSession> {
        &self.hal
    }

    pub(crate) fn stream_by_id(&self, id: StreamId) -> Option<Arc<dyn StreamInterface>> {
        self.state.lock().unwrap().streams.get(&id).cloned()
    }

    fn with_listener(&self, f: impl FnOnce(&Arc<dyn DeviceListener>)) {
        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            f(&listener);
        }
    }

    pub(crate) fn notify_listener_error(&self, kind: HalErrorKind, extras: ResultExtras) {
        self.with_listener(|l| l.notify_error(kind, extras));
    }

    /// Enter the error state. First fault wins: later faults only log.
    pub(crate) fn set_fatal(&self, cause: String) {
        {
            let mut state = self.state.lock().unwrap();
            if state.state == DeviceState::Error {
                error!(%cause, "subsequent fault in error state");
                return;
            }
            error!(%cause, "device entering error state");
            state.state = DeviceState::Error;
            state.error_cause = Some(cause);
        }
        self.request.set_paused(true);
        self.notify_listener_error(HalErrorKind::Device, ResultExtras::default());
    }

    pub(crate) fn notify_worker_idle(&self) {
        if let Some(idle) = self.status.set_active(self.worker_component, false) {
            self.handle_idle_transition(idle);
        }
    }

    pub(crate) fn notify_worker_active(&self) {
        if let Some(idle) = self.status.set_active(self.worker_component, true) {
            self.handle_idle_transition(idle);
        }
    }

    pub(crate) fn notify_inflight_active(&self) {
        if let Some(idle) = self.status.set_active(self.inflight_component, true) {
            self.handle_idle_transition(idle);
        }
    }

    fn notify_inflight_idle(&self) {
        if let Some(idle) = self.status.set_active(self.inflight_component, false) {
            self.handle_idle_transition(idle);
        }
    }

    /// React to the aggregate idle/active status flipping: toggle
    /// CONFIGURED <-> ACTIVE and notify the listener, unless the flip is
    /// an internal reconfiguration pause the caller must not observe.
    fn handle_idle_transition(&self, is_idle: bool) {
        let mut notify = false;
        {
            let mut state = self.state.lock().unwrap();
            match (state.state, is_idle) {
                (DeviceState::Active, true) => {
                    state.state = DeviceState::Configured;
                    notify = !state.internal_pause;
                    debug!("device idle, active -> configured");
                }
                (DeviceState::Configured, false) | (DeviceState::Unconfigured, false) => {
                    state.state = DeviceState::Active;
                    debug!("device busy, -> active");
                }
                _ => {}
            }
        }
        if notify {
            self.with_listener(|l| l.notify_idle());
        }
    }

    fn return_output_buffer(&self, buffer: StreamBuffer, timestamp: i64) {
        let Some(stream) = self.stream_by_id(buffer.stream_id) else {
            warn!(stream_id = buffer.stream_id, "buffer return for deleted stream, dropping");
            return;
        };
        if let Err(e) = stream.return_buffer(buffer, timestamp) {
            warn!(error = %e, "buffer return failed");
        }
    }

    fn release_input_buffer(&self, buffer: StreamBuffer) {
        let Some(stream) = self.stream_by_id(buffer.stream_id) else {
            warn!(stream_id = buffer.stream_id, "input release for deleted stream, dropping");
            return;
        };
        if let Err(e) = stream.release_input_buffer(buffer) {
            warn!(error = %e, "input buffer release failed");
        }
    }

    /// Execute tracker-computed actions outside the tracker lock.
    fn apply_actions(&self, actions: CallbackActions) {
        if let Some((extras, timestamp)) = actions.shutter {
            self.with_listener(|l| l.notify_shutter(extras, timestamp));
        }
        for (buffer, timestamp) in actions.buffers_to_return {
            self.return_output_buffer(buffer, timestamp);
        }
        if let Some(input) = actions.input_to_release {
            self.release_input_buffer(input);
        }
        if let Some(result) = actions.result {
            if let Err(e) = self.dispatcher.dispatch(result) {
                self.set_fatal(e.to_string());
            }
        }
        if actions.now_idle {
            self.notify_inflight_idle();
        }
    }
}

impl HalEvents for DeviceCore {
    fn notify(&self, msg: NotifyMsg) {
        match msg {
            NotifyMsg::Shutter {
                frame_number,
                timestamp,
            } => match self.inflight.record_shutter(frame_number, timestamp) {
                Ok(actions) => self.apply_actions(actions),
                Err(e) => self.set_fatal(e.to_string()),
            },
            NotifyMsg::Error {
                frame_number,
                stream_id: _,
                kind: HalErrorKind::Device,
            } => {
                self.set_fatal(format!(
                    "hardware reported device-level error at frame {frame_number}"
                ));
            }
            NotifyMsg::Error {
                frame_number,
                stream_id: _,
                kind,
            } => {
                let outcome = self.inflight.record_error(frame_number, kind);
                let extras = outcome.extras.unwrap_or(ResultExtras {
                    request_id: 0,
                    frame_number,
                    burst_id: 0,
                });
                self.notify_listener_error(kind, extras);
                if outcome.now_idle {
                    self.notify_inflight_idle();
                }
            }
        }
    }

    fn process_capture_result(&self, result: HalCaptureResult) {
        let max_partials = self.partial_result_count.load(Ordering::Acquire).max(1);
        match self.inflight.record_result(result, max_partials) {
            Ok(actions) => self.apply_actions(actions),
            Err(e) => self.set_fatal(e.to_string()),
        }
    }
}

/// The camera device session: turns a queue of capture requests into a
/// pipelined, asynchronously completed sequence of buffers and ordered
/// metadata results.
pub struct CameraDevice {
    interface_lock: Mutex<()>,
    core: Arc<DeviceCore>,
    worker: Mutex<Option<RequestThread>>,
}

impl CameraDevice {
    pub fn new(hal: Arc<dyn HalSession>, config: Config) -> Self {
        let status = StatusTracker::new();
        let worker_component = status.register_component("request-thread");
        let inflight_component = status.register_component("in-flight-map");
        let core = Arc::new(DeviceCore {
            config,
            hal,
            state: Mutex::new(StateInner {
                state: DeviceState::Uninitialized,
                error_cause: None,
                streams: BTreeMap::new(),
                input_stream_id: None,
                placeholder_id: None,
                next_stream_id: 0,
                need_config: true,
                internal_pause: false,
                template_cache: HashMap::new(),
            }),
            inflight: InFlightTracker::new(),
            dispatcher: ResultDispatcher::new(),
            status,
            worker_component,
            inflight_component,
            listener: Mutex::new(None),
            buffer_manager: Arc::new(BufferManager::new()),
            request: Arc::new(RequestShared::new()),
            partial_result_count: AtomicU32::new(1),
        });
        Self {
            interface_lock: Mutex::new(()),
            core,
            worker: Mutex::new(None),
        }
    }

    pub fn set_listener(&self, listener: Arc<dyn DeviceListener>) {
        *self.core.listener.lock().unwrap() = Some(listener);
    }

    pub fn state(&self) -> DeviceState {
        self.core.state.lock().unwrap().state
    }

    /// Shared buffer pool registry; exposed for diagnostics and tests.
    pub fn buffer_manager(&self) -> Arc<BufferManager> {
        Arc::clone(&self.core.buffer_manager)
    }

    /// Clone of the caller-facing result queue receiver.
    pub fn result_receiver(&self) -> flume::Receiver<CaptureResult> {
        self.core.dispatcher.receiver()
    }

    /// Open the hardware session, register callbacks and start the
    /// request worker. UNINITIALIZED -> UNCONFIGURED.
    pub fn initialize(&self) -> Result<()> {
        let _iface = self.interface_lock.lock().unwrap();
        {
            let state = self.core.state.lock().unwrap();
            if state.state != DeviceState::Uninitialized {
                return Err(CameraError::InvalidState {
                    op: "initialize",
                    state: state.state.name().into(),
                });
            }
        }
        let events: Arc<dyn HalEvents> = Arc::clone(&self.core) as Arc<dyn HalEvents>;
        let hal_info: HalDeviceInfo = self.core.hal.initialize(events)?;
        if hal_info.partial_result_count == 0 {
            return Err(CameraError::Hal {
                op: "initialize",
                message: "zero partial result count".into(),
            });
        }
        self.core
            .partial_result_count
            .store(hal_info.partial_result_count, Ordering::Release);
        self.core.request.reset();
        self.core.dispatcher.reset();
        self.core.inflight.reset();
        {
            let mut state = self.core.state.lock().unwrap();
            state.state = DeviceState::Unconfigured;
            state.need_config = true;
        }
        *self.worker.lock().unwrap() = Some(RequestThread::start(
            Arc::clone(&self.core),
            Arc::clone(&self.core.request),
        )?);
        info!(
            interface_version = hal_info.interface_version,
            partial_result_count = hal_info.partial_result_count,
            "device initialized"
        );
        Ok(())
    }

    fn check_operational(&self, op: &'static str) -> Result<()> {
        let state = self.core.state.lock().unwrap();
        match state.state {
            DeviceState::Uninitialized => Err(CameraError::InvalidState {
                op,
                state: "uninitialized".into(),
            }),
            DeviceState::Error => Err(CameraError::Fatal(
                state.error_cause.clone().unwrap_or_else(|| "unknown".into()),
            )),
            _ => Ok(()),
        }
    }

    /// Default settings for a request template, cached per template.
    pub fn construct_default_request(&self, template: RequestTemplate) -> Result<CameraMetadata> {
        self.check_operational("construct_default_request")?;
        {
            let state = self.core.state.lock().unwrap();
            if let Some(cached) = state.template_cache.get(&template) {
                return Ok(cached.clone());
            }
        }
        let settings = self.core.hal.construct_default_request_settings(template)?;
        let mut state = self.core.state.lock().unwrap();
        state.template_cache.insert(template, settings.clone());
        Ok(settings)
    }

    fn validate_requests(&self, requests: &[CaptureRequest]) -> Result<()> {
        let state = self.core.state.lock().unwrap();
        for request in requests {
            request.validate()?;
            for stream_id in &request.output_streams {
                if !state.streams.contains_key(stream_id) {
                    return Err(CameraError::BadStreamId(*stream_id));
                }
            }
            if let Some(input_id) = request.input_stream {
                if !state.streams.contains_key(&input_id) {
                    return Err(CameraError::BadStreamId(input_id));
                }
            }
        }
        Ok(())
    }

    /// Re-apply stream configuration if dirty, then admit the requests.
    fn admit_requests(&self, op: &'static str, requests: &[CaptureRequest]) -> Result<()> {
        self.check_operational(op)?;
        self.validate_requests(requests)?;
        self.ensure_configured()?;
        Ok(())
    }

    fn ensure_configured(&self) -> Result<()> {
        let result = {
            let mut state = self.core.state.lock().unwrap();
            if state.need_config || state.state == DeviceState::Unconfigured {
                configure_streams_locked(&mut state, &self.core.hal)
            } else {
                Ok(())
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(e @ CameraError::BadParameter(_)) | Err(e @ CameraError::InvalidState { .. }) => {
                Err(e)
            }
            Err(e) => {
                let message = format!("stream configuration failed: {e}");
                self.core.set_fatal(message.clone());
                Err(CameraError::Fatal(message))
            }
        }
    }

    /// Push any pending stream-set changes to the hardware immediately
    /// instead of waiting for the next submitted request.
    pub fn configure(&self) -> Result<()> {
        let _iface = self.interface_lock.lock().unwrap();
        self.check_operational("configure")?;
        self.ensure_configured()
    }

    /// Submit one single-shot request.
    pub fn capture(&self, request: CaptureRequest) -> Result<()> {
        self.capture_burst(vec![request])
    }

    /// Submit a burst of single-shot requests, admitted as a unit.
    pub fn capture_burst(&self, requests: Vec<CaptureRequest>) -> Result<()> {
        if requests.is_empty() {
            return Err(CameraError::BadParameter("empty request list".into()));
        }
        let _iface = self.interface_lock.lock().unwrap();
        self.admit_requests("capture", &requests)?;
        self.core.request.queue_requests(requests);
        Ok(())
    }

    /// Install the repeating request template (preview/video streaming).
    pub fn set_streaming_request(&self, request: CaptureRequest) -> Result<()> {
        self.set_streaming_request_list(vec![request])
    }

    pub fn set_streaming_request_list(&self, requests: Vec<CaptureRequest>) -> Result<()> {
        if requests.is_empty() {
            return Err(CameraError::BadParameter("empty repeating list".into()));
        }
        let _iface = self.interface_lock.lock().unwrap();
        self.admit_requests("set_streaming_request", &requests)?;
        self.core.request.set_repeating(requests);
        Ok(())
    }

    /// Stop streaming. Returns the frame number of the last submitted
    /// repeating request, if any was ever submitted.
    pub fn clear_streaming_request(&self) -> Result<Option<FrameNumber>> {
        let _iface = self.interface_lock.lock().unwrap();
        self.check_operational("clear_streaming_request")?;
        Ok(self.core.request.clear_repeating())
    }

    /// Queue an autofocus trigger; it is mixed into exactly the next
    /// submitted request.
    pub fn trigger_autofocus(&self, trigger_id: i32) -> Result<()> {
        self.queue_trigger_pair(
            tags::CONTROL_AF_TRIGGER,
            af_trigger::START,
            tags::CONTROL_AF_TRIGGER_ID,
            trigger_id,
        )
    }

    pub fn cancel_autofocus(&self, trigger_id: i32) -> Result<()> {
        self.queue_trigger_pair(
            tags::CONTROL_AF_TRIGGER,
            af_trigger::CANCEL,
            tags::CONTROL_AF_TRIGGER_ID,
            trigger_id,
        )
    }

    pub fn trigger_precapture(&self, trigger_id: i32) -> Result<()> {
        self.queue_trigger_pair(
            tags::CONTROL_AE_PRECAPTURE_TRIGGER,
            precapture_trigger::START,
            tags::CONTROL_AE_PRECAPTURE_ID,
            trigger_id,
        )
    }

    fn queue_trigger_pair(&self, tag: u32, value: i32, id_tag: u32, id: i32) -> Result<()> {
        self.check_operational("trigger")?;
        self.core.request.queue_trigger(Trigger { tag, value });
        self.core.request.queue_trigger(Trigger {
            tag: id_tag,
            value: id,
        });
        Ok(())
    }

    /// Block for the next completed capture result.
    pub fn wait_for_next_result(&self, timeout: Duration) -> Result<CaptureResult> {
        self.core.dispatcher.wait_for_next(timeout)
    }

    /// Block until the worker has submitted the request with this id.
    pub fn wait_until_request_processed(&self, request_id: i32, timeout: Duration) -> Result<()> {
        self.core.request.wait_for_request_submitted(request_id, timeout)
    }

    /// Create an output stream. A `set_id` makes it buffer-manager-backed
    /// within that sharing group.
    #[allow(clippy::too_many_arguments)]
    pub fn create_stream(
        &self,
        consumer: Arc<dyn BufferConsumer>,
        width: u32,
        height: u32,
        format: PixelFormat,
        dataspace: u32,
        rotation: Rotation,
        set_id: Option<SetId>,
    ) -> Result<StreamId> {
        let _iface = self.interface_lock.lock().unwrap();
        self.check_operational("create_stream")?;
        self.structural_change(|state| {
            let id = state.next_stream_id;
            state.next_stream_id += 1;
            let info = StreamInfo {
                id,
                set_id,
                width,
                height,
                format,
                dataspace,
                rotation,
                usage: BufferUsage::HW_CAMERA_WRITE,
                max_buffers: 2,
            };
            let stream: Arc<dyn StreamInterface> = match set_id {
                Some(_) => Arc::new(OutputStream::with_buffer_manager(
                    info,
                    consumer,
                    Arc::clone(&self.core.buffer_manager),
                )?),
                None => Arc::new(OutputStream::new(info, consumer)),
            };
            state.streams.insert(id, stream);
            state.need_config = true;
            info!(stream_id = id, width, height, "output stream created");
            Ok(id)
        })
    }

    /// Create the reprocessing input stream; at most one may exist.
    pub fn create_input_stream(
        &self,
        producer: Arc<dyn BufferProducer>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<StreamId> {
        let _iface = self.interface_lock.lock().unwrap();
        self.check_operational("create_input_stream")?;
        self.structural_change(|state| {
            if state.input_stream_id.is_some() {
                return Err(CameraError::BadParameter(
                    "device already has an input stream".into(),
                ));
            }
            let id = state.next_stream_id;
            state.next_stream_id += 1;
            let info = StreamInfo {
                id,
                set_id: None,
                width,
                height,
                format,
                dataspace: 0,
                rotation: Rotation::None,
                usage: BufferUsage::HW_CAMERA_READ,
                max_buffers: 2,
            };
            state
                .streams
                .insert(id, Arc::new(InputStream::new(info, producer)));
            state.input_stream_id = Some(id);
            state.need_config = true;
            info!(stream_id = id, width, height, "input stream created");
            Ok(id)
        })
    }

    /// Create a bidirectional ZSL stream with a ring of `depth` captures.
    pub fn create_zsl_stream(
        &self,
        width: u32,
        height: u32,
        depth: usize,
    ) -> Result<StreamId> {
        if depth == 0 {
            return Err(CameraError::BadParameter("zero ZSL ring depth".into()));
        }
        let _iface = self.interface_lock.lock().unwrap();
        self.check_operational("create_zsl_stream")?;
        self.structural_change(|state| {
            let id = state.next_stream_id;
            state.next_stream_id += 1;
            let info = StreamInfo {
                id,
                set_id: None,
                width,
                height,
                format: PixelFormat::RawOpaque,
                dataspace: 0,
                rotation: Rotation::None,
                usage: BufferUsage::HW_CAMERA_READ | BufferUsage::HW_CAMERA_WRITE,
                max_buffers: 2,
            };
            state.streams.insert(id, Arc::new(ZslStream::new(info, depth)));
            state.need_config = true;
            info!(stream_id = id, depth, "ZSL stream created");
            Ok(id)
        })
    }

    /// Delete a stream; refuses while its buffers are outstanding or
    /// while the installed repeating request still targets it.
    pub fn delete_stream(&self, stream_id: StreamId) -> Result<()> {
        let _iface = self.interface_lock.lock().unwrap();
        self.check_operational("delete_stream")?;
        if self.core.request.repeating_targets().contains(&stream_id) {
            return Err(CameraError::BadParameter(format!(
                "stream {stream_id} is targeted by the repeating request"
            )));
        }
        self.structural_change(|state| {
            if state.placeholder_id == Some(stream_id) {
                return Err(CameraError::BadStreamId(stream_id));
            }
            let Some(stream) = state.streams.remove(&stream_id) else {
                return Err(CameraError::BadStreamId(stream_id));
            };
            if let Err(e) = stream.disconnect() {
                // Put it back; the caller must drain first.
                state.streams.insert(stream_id, stream);
                return Err(e);
            }
            if state.input_stream_id == Some(stream_id) {
                state.input_stream_id = None;
            }
            state.need_config = true;
            info!(stream_id, "stream deleted");
            Ok(())
        })
    }

    /// Run a stream-set mutation, transparently pausing and resuming the
    /// pipeline when the device is actively streaming. The external
    /// listener sees no state flicker from the internal pause.
    fn structural_change<T>(&self, mutate: impl FnOnce(&mut StateInner) -> Result<T>) -> Result<T> {
        let was_active = {
            let state = self.core.state.lock().unwrap();
            state.state == DeviceState::Active
        };
        if was_active {
            self.begin_internal_pause()?;
        }
        let result = {
            let mut state = self.core.state.lock().unwrap();
            let value = mutate(&mut state);
            // While actively streaming, reconfigure before resuming so
            // the worker never sees a dirty stream set.
            match value {
                Ok(v) if was_active => {
                    configure_streams_locked(&mut state, &self.core.hal).map(|_| v)
                }
                other => other,
            }
        };
        if was_active {
            self.end_internal_pause();
        }
        result
    }

    fn begin_internal_pause(&self) -> Result<()> {
        {
            let mut state = self.core.state.lock().unwrap();
            state.internal_pause = true;
        }
        self.core.request.set_paused(true);
        let timeout = self.core.config.active_timeout();
        if let Err(e) = self.core.status.wait_until_idle(timeout) {
            self.end_internal_pause();
            return Err(e);
        }
        Ok(())
    }

    fn end_internal_pause(&self) {
        self.core.request.set_paused(false);
        let mut state = self.core.state.lock().unwrap();
        state.internal_pause = false;
    }

    /// Pre-allocate a stream's buffers off the hot path. Emits
    /// `notify_prepared` on completion.
    pub fn prepare(&self, stream_id: StreamId) -> Result<()> {
        let _iface = self.interface_lock.lock().unwrap();
        self.check_operational("prepare")?;
        let is_streaming_target = self.core.request.repeating_targets().contains(&stream_id);
        if self.state() == DeviceState::Active && is_streaming_target {
            return Err(CameraError::InvalidState {
                op: "prepare",
                state: "stream targeted by active repeating request".into(),
            });
        }
        let stream = self
            .core
            .stream_by_id(stream_id)
            .ok_or(CameraError::BadStreamId(stream_id))?;
        let max = stream.info().max_buffers;
        stream.prepare(max)?;
        self.core.with_listener(|l| l.notify_prepared(stream_id));
        Ok(())
    }

    /// Drop a stream's cached buffers.
    pub fn tear_down(&self, stream_id: StreamId) -> Result<()> {
        let _iface = self.interface_lock.lock().unwrap();
        self.check_operational("tear_down")?;
        let stream = self
            .core
            .stream_by_id(stream_id)
            .ok_or(CameraError::BadStreamId(stream_id))?;
        stream.tear_down()
    }

    /// Abort all in-flight work: clear the local queue (synthesizing
    /// error notifications for requests that never reached the hardware)
    /// and tell the hardware to flush.
    pub fn flush(&self) -> Result<()> {
        let _iface = self.interface_lock.lock().unwrap();
        {
            let state = self.core.state.lock().unwrap();
            if state.state == DeviceState::Uninitialized {
                return Err(CameraError::InvalidState {
                    op: "flush",
                    state: "uninitialized".into(),
                });
            }
        }
        let dropped = self.core.request.drain_for_flush();
        for request in dropped {
            self.core.notify_listener_error(
                HalErrorKind::Request,
                ResultExtras {
                    request_id: request.request_id,
                    frame_number: 0,
                    burst_id: request.burst_id,
                },
            );
        }
        // Serialized against any batch currently being handed to the
        // hardware.
        let _guard = self.core.request.flush_guard();
        self.core.hal.flush()?;
        info!("device flushed");
        Ok(())
    }

    /// Block until the pipeline reports idle; exceeding the shutdown
    /// timeout is a fatal device error.
    pub fn wait_until_drained(&self) -> Result<()> {
        let timeout = self.core.config.shutdown_timeout();
        match self.core.status.wait_until_idle(timeout) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.core
                    .set_fatal(format!("pipeline failed to drain: {e}"));
                Err(e)
            }
        }
    }

    /// Drain, stop the worker, tear down streams, close the hardware.
    /// Returns the device to UNINITIALIZED from any state.
    pub fn disconnect(&self) -> Result<()> {
        let _iface = self.interface_lock.lock().unwrap();
        let current = self.state();
        if current == DeviceState::Uninitialized {
            return Ok(());
        }
        info!(state = current.name(), "disconnecting device");

        let _ = self.core.request.drain_for_flush();
        if current == DeviceState::Active {
            let timeout = self.core.config.shutdown_timeout();
            if self.core.status.wait_until_idle(timeout).is_err() {
                // Fatal by contract, but teardown continues regardless.
                self.core
                    .set_fatal("pipeline failed to drain during disconnect".into());
            }
        }

        if let Some(mut worker) = self.worker.lock().unwrap().take() {
            worker.stop();
        }

        // Give parked buffers back to their streams so disconnect can
        // succeed, then drop the tracker state.
        for (mut buffer, _extras) in self.core.inflight.clear() {
            buffer.status = BufferStatus::Error;
            self.core.return_output_buffer(buffer, 0);
        }
        self.core.inflight.reset();

        let streams: Vec<Arc<dyn StreamInterface>> = {
            let mut state = self.core.state.lock().unwrap();
            state.input_stream_id = None;
            state.placeholder_id = None;
            state.template_cache.clear();
            std::mem::take(&mut state.streams).into_values().collect()
        };
        for stream in streams {
            if let Err(e) = stream.disconnect() {
                warn!(stream_id = stream.id(), error = %e, "stream disconnect during teardown failed");
            }
        }

        self.core.hal.close();
        self.core.dispatcher.reset();
        self.core.status.set_active(self.core.worker_component, false);
        self.core.status.set_active(self.core.inflight_component, false);
        {
            let mut state = self.core.state.lock().unwrap();
            state.state = DeviceState::Uninitialized;
            state.error_cause = None;
            state.need_config = true;
            state.internal_pause = false;
        }
        info!("device disconnected");
        Ok(())
    }
}

impl Drop for CameraDevice {
    fn drop(&mut self) {
        if self.state() != DeviceState::Uninitialized {
            let _ = self.disconnect();
        }
    }
}

/// Apply the two-phase configuration across the whole stream set. Caller
/// holds the state lock. A zero-output-stream set gets a placeholder
/// stream inserted first; the placeholder is removed once real streams
/// exist again.
fn configure_streams_locked(state: &mut StateInner, hal: &Arc<dyn HalSession>) -> Result<()> {
    let has_real_output = state.streams.iter().any(|(id, stream)| {
        Some(*id) != state.placeholder_id && stream.kind() != StreamKind::Input
    });
    if !has_real_output && state.placeholder_id.is_none() {
        let id = state.next_stream_id;
        state.next_stream_id += 1;
        state.streams.insert(id, Arc::new(PlaceholderStream::new(id)));
        state.placeholder_id = Some(id);
        info!(stream_id = id, "inserted placeholder stream for empty configuration");
    } else if has_real_output {
        if let Some(placeholder_id) = state.placeholder_id.take() {
            if let Some(placeholder) = state.streams.remove(&placeholder_id) {
                if let Err(e) = placeholder.disconnect() {
                    warn!(error = %e, "placeholder disconnect failed");
                }
            }
            info!(stream_id = placeholder_id, "removed placeholder stream");
        }
    }

    let mut configs = Vec::with_capacity(state.streams.len());
    let mut started: Vec<StreamId> = Vec::with_capacity(state.streams.len());
    for (id, stream) in &state.streams {
        match stream.start_configuration() {
            Ok(config) => {
                configs.push(config);
                started.push(*id);
            }
            Err(e) => {
                cancel_started(state, &started);
                return Err(e);
            }
        }
    }

    if let Err(e) = hal.configure_streams(&mut configs) {
        cancel_started(state, &started);
        return Err(e);
    }

    for config in &configs {
        if let Some(stream) = state.streams.get(&config.stream_id) {
            stream.finish_configuration(config)?;
        }
    }

    state.need_config = false;
    if state.state == DeviceState::Unconfigured {
        state.state = DeviceState::Configured;
    }
    debug!(streams = configs.len(), "stream configuration applied");
    Ok(())
}

fn cancel_started(state: &StateInner, started: &[StreamId]) {
    for id in started {
        if let Some(stream) = state.streams.get(id) {
            if let Err(e) = stream.cancel_configuration() {
                warn!(stream_id = *id, error = %e, "cancel_configuration failed");
            }
        }
    }
}
