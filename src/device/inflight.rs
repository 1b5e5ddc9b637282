//! In-flight request tracking: per-frame bookkeeping between submission
//! and full resolution
//!
//! Entries buffer whatever arrives early (buffers before shutter,
//! metadata before shutter) and release it once the shutter timestamp is
//! authoritative. An entry is removable only when its outstanding buffer
//! count is zero AND (it failed OR both metadata is complete and the
//! shutter is known).

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::device::results::CaptureResult;
use crate::error::{CameraError, Result};
use crate::hal::{FrameNumber, HalCaptureResult, HalErrorKind, StreamBuffer};
use crate::metadata::{tags, CameraMetadata};
use crate::request::ResultExtras;

pub(crate) struct InFlightRequest {
    pub extras: ResultExtras,
    pub shutter_received: bool,
    pub shutter_timestamp: i64,
    pub sensor_timestamp: i64,
    pub buffers_outstanding: usize,
    pub metadata_received: bool,
    pub highest_partial: u32,
    pub collected_partials: CameraMetadata,
    /// Final metadata parked until the shutter timestamp arrives.
    pub pending_metadata: Option<CameraMetadata>,
    /// Output buffers parked until the shutter timestamp arrives.
    pub pending_buffers: Vec<StreamBuffer>,
    pub has_input: bool,
    pub failed: bool,
}

impl InFlightRequest {
    fn removable(&self) -> bool {
        self.buffers_outstanding == 0
            && (self.failed || (self.metadata_received && self.shutter_received))
    }
}

/// Work the device must perform after a tracker update, outside the
/// tracker lock: listener calls, buffer returns, result dispatch.
#[derive(Debug, Default)]
pub(crate) struct CallbackActions {
    pub shutter: Option<(ResultExtras, i64)>,
    /// Buffers to hand back to their streams, with presentation timestamp.
    pub buffers_to_return: Vec<(StreamBuffer, i64)>,
    pub input_to_release: Option<StreamBuffer>,
    pub result: Option<CaptureResult>,
    /// The tracker just drained to empty.
    pub now_idle: bool,
}

pub(crate) struct ErrorActions {
    pub extras: Option<ResultExtras>,
    pub now_idle: bool,
}

struct TrackerInner {
    map: BTreeMap<FrameNumber, InFlightRequest>,
    /// Strictly-increasing shutter ordering check.
    next_shutter_frame: FrameNumber,
}

pub(crate) struct InFlightTracker {
    inner: Mutex<TrackerInner>,
}

impl InFlightTracker {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                map: BTreeMap::new(),
                next_shutter_frame: 0,
            }),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub(crate) fn contains(&self, frame: FrameNumber) -> bool {
        self.inner.lock().unwrap().map.contains_key(&frame)
    }

    /// Insert a fresh entry. Must happen exactly once per frame, before
    /// submission to the hardware. Returns true when the tracker was
    /// empty beforehand (the in-flight component just went active).
    pub(crate) fn register(
        &self,
        extras: ResultExtras,
        buffer_count: usize,
        has_input: bool,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let frame = extras.frame_number;
        if inner.map.contains_key(&frame) {
            return Err(CameraError::Fatal(format!(
                "frame {frame} registered in flight twice"
            )));
        }
        let was_empty = inner.map.is_empty();
        inner.map.insert(
            frame,
            InFlightRequest {
                extras,
                shutter_received: false,
                shutter_timestamp: 0,
                sensor_timestamp: 0,
                buffers_outstanding: buffer_count,
                metadata_received: false,
                highest_partial: 0,
                collected_partials: CameraMetadata::new(),
                pending_metadata: None,
                pending_buffers: Vec::new(),
                has_input,
                failed: false,
            },
        );
        Ok(was_empty)
    }

    /// Apply a shutter notification. Fatal on out-of-order frames: the
    /// hardware is contractually required to deliver shutters in
    /// submission order.
    pub(crate) fn record_shutter(&self, frame: FrameNumber, timestamp: i64) -> Result<CallbackActions> {
        let mut inner = self.inner.lock().unwrap();
        if frame < inner.next_shutter_frame {
            return Err(CameraError::Fatal(format!(
                "out-of-order shutter for frame {frame}, expected >= {}",
                inner.next_shutter_frame
            )));
        }
        inner.next_shutter_frame = frame + 1;

        let mut actions = CallbackActions::default();
        let Some(entry) = inner.map.get_mut(&frame) else {
            // Legal after a flush cleared the entry.
            warn!(frame, "shutter for unknown frame");
            return Ok(actions);
        };
        entry.shutter_received = true;
        entry.shutter_timestamp = timestamp;
        actions.shutter = Some((entry.extras, timestamp));

        // Release anything that was waiting on the timestamp.
        for buffer in entry.pending_buffers.drain(..) {
            actions.buffers_to_return.push((buffer, timestamp));
        }
        if let Some(final_metadata) = entry.pending_metadata.take() {
            if entry.sensor_timestamp != 0 && entry.sensor_timestamp != timestamp {
                return Err(CameraError::Fatal(format!(
                    "frame {frame}: sensor timestamp {} disagrees with shutter {timestamp}",
                    entry.sensor_timestamp
                )));
            }
            let mut metadata = entry.collected_partials.clone();
            metadata.merge(&final_metadata);
            actions.result = Some(CaptureResult {
                extras: entry.extras,
                metadata,
            });
            entry.metadata_received = true;
        }

        Self::finish_update(&mut inner, frame, &mut actions);
        Ok(actions)
    }

    /// Apply a per-frame error notification (request/result/buffer).
    pub(crate) fn record_error(&self, frame: FrameNumber, kind: HalErrorKind) -> ErrorActions {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.map.get_mut(&frame) else {
            warn!(frame, ?kind, "error notification for unknown frame");
            return ErrorActions {
                extras: None,
                now_idle: false,
            };
        };
        let extras = entry.extras;
        match kind {
            // Request and result errors mean final metadata will never
            // arrive; the failed flag becomes the cleanup path.
            HalErrorKind::Request | HalErrorKind::Result => entry.failed = true,
            // A buffer error is resolved by the buffer itself coming back
            // with error status.
            HalErrorKind::Buffer => {}
            // Device errors escalate before reaching the tracker; treat a
            // stray one like a request failure.
            HalErrorKind::Device => {
                warn!(frame, "device-level error reached per-frame tracking");
                entry.failed = true;
            }
        }
        let mut actions = CallbackActions::default();
        Self::finish_update(&mut inner, frame, &mut actions);
        ErrorActions {
            extras: Some(extras),
            now_idle: actions.now_idle,
        }
    }

    /// Apply one capture-result delivery: partial or final metadata and/or
    /// a subset of the frame's buffers, in any combination.
    pub(crate) fn record_result(
        &self,
        result: HalCaptureResult,
        max_partials: u32,
    ) -> Result<CallbackActions> {
        let mut inner = self.inner.lock().unwrap();
        let frame = result.frame_number;
        let mut actions = CallbackActions::default();

        let Some(entry) = inner.map.get_mut(&frame) else {
            // Entry already purged (flush); return buffers so nothing
            // leaks, with no meaningful timestamp.
            warn!(frame, "capture result for unknown frame");
            for buffer in result.output_buffers {
                actions.buffers_to_return.push((buffer, 0));
            }
            actions.input_to_release = result.input_buffer;
            return Ok(actions);
        };

        if let Some(metadata) = result.metadata {
            if result.partial_result == 0 || result.partial_result > max_partials {
                return Err(CameraError::Fatal(format!(
                    "frame {frame}: partial result index {} outside 1..={max_partials}",
                    result.partial_result
                )));
            }
            if result.partial_result == max_partials {
                // Final metadata chunk.
                if entry.metadata_received || entry.pending_metadata.is_some() {
                    return Err(CameraError::Fatal(format!(
                        "frame {frame}: duplicate final metadata"
                    )));
                }
                if let Some(sensor_ts) = metadata.get_i64(tags::SENSOR_TIMESTAMP) {
                    entry.sensor_timestamp = sensor_ts;
                }
                if entry.shutter_received {
                    if entry.sensor_timestamp != 0
                        && entry.sensor_timestamp != entry.shutter_timestamp
                    {
                        return Err(CameraError::Fatal(format!(
                            "frame {frame}: sensor timestamp {} disagrees with shutter {}",
                            entry.sensor_timestamp, entry.shutter_timestamp
                        )));
                    }
                    let mut merged = entry.collected_partials.clone();
                    merged.merge(&metadata);
                    actions.result = Some(CaptureResult {
                        extras: entry.extras,
                        metadata: merged,
                    });
                    entry.metadata_received = true;
                } else {
                    // Hold until the shutter fixes the timestamp.
                    entry.pending_metadata = Some(metadata);
                }
            } else {
                entry.collected_partials.merge(&metadata);
                entry.highest_partial = entry.highest_partial.max(result.partial_result);
            }
        }

        for buffer in result.output_buffers {
            if entry.buffers_outstanding == 0 {
                return Err(CameraError::Fatal(format!(
                    "frame {frame}: more buffers returned than registered"
                )));
            }
            entry.buffers_outstanding -= 1;
            if entry.shutter_received {
                actions
                    .buffers_to_return
                    .push((buffer, entry.shutter_timestamp));
            } else {
                entry.pending_buffers.push(buffer);
            }
        }

        if let Some(input) = result.input_buffer {
            if !entry.has_input {
                return Err(CameraError::Fatal(format!(
                    "frame {frame}: input buffer returned for request without input"
                )));
            }
            if entry.buffers_outstanding == 0 {
                return Err(CameraError::Fatal(format!(
                    "frame {frame}: more buffers returned than registered"
                )));
            }
            entry.buffers_outstanding -= 1;
            actions.input_to_release = Some(input);
        }

        Self::finish_update(&mut inner, frame, &mut actions);
        Ok(actions)
    }

    fn finish_update(inner: &mut TrackerInner, frame: FrameNumber, actions: &mut CallbackActions) {
        let removable = inner
            .map
            .get(&frame)
            .map(|e| e.removable())
            .unwrap_or(false);
        if !removable {
            return;
        }
        if let Some(entry) = inner.map.remove(&frame) {
            debug!(
                frame,
                failed = entry.failed,
                "in-flight entry resolved"
            );
            // A failed entry may still hold parked buffers; surface them
            // so the streams get their capacity back.
            for buffer in entry.pending_buffers {
                actions.buffers_to_return.push((buffer, 0));
            }
            actions.now_idle = inner.map.is_empty();
        }
    }

    /// Drop every entry, returning parked buffers for stream cleanup.
    pub(crate) fn clear(&self) -> Vec<(StreamBuffer, ResultExtras)> {
        let mut inner = self.inner.lock().unwrap();
        let mut parked = Vec::new();
        for (_, entry) in std::mem::take(&mut inner.map) {
            for buffer in entry.pending_buffers {
                parked.push((buffer, entry.extras));
            }
        }
        parked
    }

    pub(crate) fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.clear();
        inner.next_shutter_frame = 0;
    }
}
