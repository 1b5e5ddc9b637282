//! Capture requests and trigger bookkeeping

pub mod thread;

use crate::error::{CameraError, Result};
use crate::hal::FrameNumber;
use crate::metadata::{tags, CameraMetadata, Tag};
use crate::stream::StreamId;

/// Correlation extras carried alongside every result and error
/// notification for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResultExtras {
    pub request_id: i32,
    /// Assigned when the request is dequeued by the worker; 0 for
    /// requests that never reached the pipeline (e.g. flushed out).
    pub frame_number: FrameNumber,
    pub burst_id: i32,
}

/// One capture request. Immutable once submitted; the in-flight tracker
/// references it by its extras until the frame fully resolves.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub settings: CameraMetadata,
    pub output_streams: Vec<StreamId>,
    pub input_stream: Option<StreamId>,
    /// Requests sharing one hardware submission window (constrained
    /// high-speed sessions) carry the same batch size > 1.
    pub batch_size: usize,
    pub request_id: i32,
    pub burst_id: i32,
}

impl CaptureRequest {
    pub fn new(settings: CameraMetadata, output_streams: Vec<StreamId>) -> Self {
        Self {
            settings,
            output_streams,
            input_stream: None,
            batch_size: 1,
            request_id: 0,
            burst_id: 0,
        }
    }

    pub fn with_request_id(mut self, request_id: i32) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_input_stream(mut self, stream_id: StreamId) -> Self {
        self.input_stream = Some(stream_id);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.output_streams.is_empty() {
            return Err(CameraError::BadParameter(
                "request targets no output streams".into(),
            ));
        }
        Ok(())
    }
}

/// A pending metadata trigger, mixed into exactly the next submitted
/// request and removed afterward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Trigger {
    pub tag: Tag,
    pub value: i32,
}

/// Companion trigger-id tag for a trigger tag, if it has one.
fn companion_id_tag(tag: Tag) -> Option<Tag> {
    match tag {
        tags::CONTROL_AF_TRIGGER => Some(tags::CONTROL_AF_TRIGGER_ID),
        tags::CONTROL_AE_PRECAPTURE_TRIGGER => Some(tags::CONTROL_AE_PRECAPTURE_ID),
        _ => None,
    }
}

/// Mix pending triggers into one request's settings. A trigger tag with
/// no companion trigger-id present gets a placeholder id inserted for
/// hardware compatibility.
pub(crate) fn apply_triggers(settings: &mut CameraMetadata, triggers: &[Trigger]) {
    for trigger in triggers {
        settings.set_i32(trigger.tag, trigger.value);
        if let Some(id_tag) = companion_id_tag(trigger.tag) {
            if !settings.contains(id_tag) {
                settings.set_i32(id_tag, tags::PLACEHOLDER_TRIGGER_ID);
            }
        }
    }
}
