//! Shared test harness: a scripted hardware double and a recording
//! listener, plus a fully wired device rig.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use artemis::buffer::{BufferUsage, PixelFormat};
use artemis::device::{CameraDevice, DeviceListener};
use artemis::error::{CameraError, Result};
use artemis::hal::{
    BufferStatus, FrameNumber, HalCaptureResult, HalDeviceInfo, HalErrorKind, HalEvents,
    HalRequest, HalSession, HalStreamConfig, NotifyMsg, RequestTemplate,
};
use artemis::metadata::{tags, CameraMetadata};
use artemis::request::ResultExtras;
use artemis::stream::{FifoQueue, Rotation, StreamId};
use artemis::Config;

pub const TEMPLATE_MARKER: u32 = 0x9000;

struct FakeInner {
    events: Option<Arc<dyn HalEvents>>,
    batches: Vec<Vec<HalRequest>>,
    configs: Vec<Vec<HalStreamConfig>>,
    template_requests: usize,
    flushes: usize,
    closed: bool,
    fail_submission: bool,
}

/// Scripted hardware double. Records everything the device submits and
/// lets tests drive the asynchronous callbacks by hand.
pub struct FakeHal {
    partial_result_count: u32,
    max_buffers: usize,
    inner: Mutex<FakeInner>,
}

impl FakeHal {
    pub fn new() -> Arc<Self> {
        Self::with_partial_count(1)
    }

    pub fn with_partial_count(partial_result_count: u32) -> Arc<Self> {
        Arc::new(Self {
            partial_result_count,
            max_buffers: 4,
            inner: Mutex::new(FakeInner {
                events: None,
                batches: Vec::new(),
                configs: Vec::new(),
                template_requests: 0,
                flushes: 0,
                closed: false,
                fail_submission: false,
            }),
        })
    }

    fn events(&self) -> Arc<dyn HalEvents> {
        self.inner
            .lock()
            .unwrap()
            .events
            .clone()
            .expect("hardware not initialized")
    }

    pub fn set_fail_submission(&self, fail: bool) {
        self.inner.lock().unwrap().fail_submission = fail;
    }

    /// Every submitted request, flattened across batches, in order.
    pub fn submitted(&self) -> Vec<HalRequest> {
        self.inner
            .lock()
            .unwrap()
            .batches
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// Per-batch request counts, in submission order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.inner
            .lock()
            .unwrap()
            .batches
            .iter()
            .map(|b| b.len())
            .collect()
    }

    /// Stream ids of the most recently applied configuration.
    pub fn last_configured_ids(&self) -> Vec<StreamId> {
        self.inner
            .lock()
            .unwrap()
            .configs
            .last()
            .map(|set| set.iter().map(|c| c.stream_id).collect())
            .unwrap_or_default()
    }

    pub fn flush_count(&self) -> usize {
        self.inner.lock().unwrap().flushes
    }

    pub fn template_request_count(&self) -> usize {
        self.inner.lock().unwrap().template_requests
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Block until at least `count` requests have been submitted.
    pub fn wait_for_submitted(&self, count: usize, timeout: Duration) -> Vec<HalRequest> {
        let deadline = Instant::now() + timeout;
        loop {
            let submitted = self.submitted();
            if submitted.len() >= count {
                return submitted;
            }
            assert!(
                Instant::now() < deadline,
                "only {} of {count} requests submitted within {timeout:?}",
                submitted.len()
            );
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    pub fn shutter(&self, frame: FrameNumber, timestamp: i64) {
        self.events().notify(NotifyMsg::Shutter {
            frame_number: frame,
            timestamp,
        });
    }

    pub fn notify_error(&self, frame: FrameNumber, kind: HalErrorKind) {
        self.events().notify(NotifyMsg::Error {
            frame_number: frame,
            stream_id: None,
            kind,
        });
    }

    pub fn deliver(&self, result: HalCaptureResult) {
        self.events().process_capture_result(result);
    }

    /// Final metadata + all of the request's buffers, in one delivery.
    pub fn final_result(&self, request: &HalRequest, timestamp: i64) -> HalCaptureResult {
        let mut metadata = CameraMetadata::new();
        metadata.set_i64(tags::SENSOR_TIMESTAMP, timestamp);
        HalCaptureResult {
            frame_number: request.frame_number,
            partial_result: self.partial_result_count,
            metadata: Some(metadata),
            output_buffers: request
                .output_buffers
                .iter()
                .cloned()
                .map(|mut b| {
                    b.status = BufferStatus::Ok;
                    b
                })
                .collect(),
            input_buffer: request.input_buffer.clone(),
        }
    }

    /// Shutter followed by the complete result, the common happy path.
    pub fn complete(&self, request: &HalRequest, timestamp: i64) {
        self.shutter(request.frame_number, timestamp);
        self.deliver(self.final_result(request, timestamp));
    }
}

impl HalSession for FakeHal {
    fn initialize(&self, events: Arc<dyn HalEvents>) -> Result<HalDeviceInfo> {
        self.inner.lock().unwrap().events = Some(events);
        Ok(HalDeviceInfo {
            interface_version: 3,
            partial_result_count: self.partial_result_count,
        })
    }

    fn configure_streams(&self, streams: &mut [HalStreamConfig]) -> Result<()> {
        if streams.is_empty() {
            return Err(CameraError::BadParameter("empty stream configuration".into()));
        }
        for config in streams.iter_mut() {
            config.max_buffers = self.max_buffers;
        }
        self.inner.lock().unwrap().configs.push(streams.to_vec());
        Ok(())
    }

    fn construct_default_request_settings(
        &self,
        template: RequestTemplate,
    ) -> Result<CameraMetadata> {
        self.inner.lock().unwrap().template_requests += 1;
        let mut settings = CameraMetadata::new();
        settings.set_i32(TEMPLATE_MARKER, template as i32);
        Ok(settings)
    }

    fn process_capture_request(&self, requests: Vec<HalRequest>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_submission {
            return Err(CameraError::Hal {
                op: "process_capture_request",
                message: "scripted submission failure".into(),
            });
        }
        inner.batches.push(requests);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.inner.lock().unwrap().flushes += 1;
        Ok(())
    }

    fn close(&self) {
        self.inner.lock().unwrap().closed = true;
    }
}

#[derive(Default)]
pub struct ListenerLog {
    pub errors: Vec<(HalErrorKind, ResultExtras)>,
    pub shutters: Vec<(ResultExtras, i64)>,
    pub idles: usize,
    pub prepared: Vec<StreamId>,
}

#[derive(Default)]
pub struct RecordingListener {
    log: Mutex<ListenerLog>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn errors(&self) -> Vec<(HalErrorKind, ResultExtras)> {
        self.log.lock().unwrap().errors.clone()
    }

    pub fn device_error_count(&self) -> usize {
        self.log
            .lock()
            .unwrap()
            .errors
            .iter()
            .filter(|(kind, _)| *kind == HalErrorKind::Device)
            .count()
    }

    pub fn shutters(&self) -> Vec<(ResultExtras, i64)> {
        self.log.lock().unwrap().shutters.clone()
    }

    pub fn idle_count(&self) -> usize {
        self.log.lock().unwrap().idles
    }

    pub fn prepared(&self) -> Vec<StreamId> {
        self.log.lock().unwrap().prepared.clone()
    }
}

impl DeviceListener for RecordingListener {
    fn notify_error(&self, kind: HalErrorKind, extras: ResultExtras) {
        self.log.lock().unwrap().errors.push((kind, extras));
    }

    fn notify_shutter(&self, extras: ResultExtras, timestamp: i64) {
        self.log.lock().unwrap().shutters.push((extras, timestamp));
    }

    fn notify_idle(&self) {
        self.log.lock().unwrap().idles += 1;
    }

    fn notify_prepared(&self, stream_id: StreamId) {
        self.log.lock().unwrap().prepared.push(stream_id);
    }
}

/// Short timeouts so failure paths stay fast under test.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.timeouts.request_starvation_ms = 20;
    config.timeouts.buffer_acquire_ms = 200;
    config.timeouts.active_ms = 500;
    config.timeouts.shutdown_ms = 2000;
    config
}

pub struct TestRig {
    pub device: CameraDevice,
    pub hal: Arc<FakeHal>,
    pub listener: Arc<RecordingListener>,
    pub consumer: Arc<FifoQueue>,
    pub stream_id: StreamId,
}

/// Initialized device with one plain output stream.
pub fn rig() -> TestRig {
    rig_with_hal(FakeHal::new())
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn rig_with_hal(hal: Arc<FakeHal>) -> TestRig {
    init_tracing();
    let device = CameraDevice::new(hal.clone(), test_config());
    let listener = RecordingListener::new();
    device.set_listener(listener.clone());
    device.initialize().unwrap();
    let consumer = Arc::new(FifoQueue::new(
        640,
        480,
        PixelFormat::Nv12,
        BufferUsage::HW_CAMERA_WRITE,
        8,
    ));
    let stream_id = device
        .create_stream(
            consumer.clone(),
            640,
            480,
            PixelFormat::Nv12,
            0,
            Rotation::None,
            None,
        )
        .unwrap();
    TestRig {
        device,
        hal,
        listener,
        consumer,
        stream_id,
    }
}

/// Poll a condition until it holds or the timeout elapses.
pub fn poll_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Hand every queued consumer buffer back into the free pool.
pub fn recycle(consumer: &FifoQueue) {
    while let Some((buffer, _)) = consumer.acquire() {
        consumer.release(buffer);
    }
}
