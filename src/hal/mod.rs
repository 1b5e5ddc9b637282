//! Hardware session contract
//!
//! The device core drives an implementation of [`HalSession`] and receives
//! its two asynchronous callback types through [`HalEvents`]. Callbacks may
//! arrive on any thread, in any order across frames; the only ordering the
//! hardware must preserve is per-frame shutter order matching submission
//! order.

use std::sync::Arc;

use crate::buffer::{BufferUsage, GraphicBuffer, PixelFormat};
use crate::error::Result;
use crate::metadata::CameraMetadata;
use crate::stream::StreamId;

/// Frame number: strictly increasing, assigned at request dequeue.
pub type FrameNumber = u64;

/// Request templates the hardware provides default settings for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestTemplate {
    Preview,
    StillCapture,
    Record,
    VideoSnapshot,
    ZslCapture,
}

/// Capabilities reported by the hardware at initialization.
///
/// `partial_result_count == 1` models the legacy vintage that delivers
/// result metadata in a single chunk; larger values allow incremental
/// partial results up to that ceiling.
#[derive(Debug, Clone)]
pub struct HalDeviceInfo {
    pub interface_version: u32,
    pub partial_result_count: u32,
}

/// Error classes the hardware can report via `notify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalErrorKind {
    /// Unrecoverable device-level fault; escalates to the error state.
    Device,
    /// One request failed entirely.
    Request,
    /// Result metadata for one frame will not be delivered.
    Result,
    /// One output buffer for one frame was not filled.
    Buffer,
}

/// Asynchronous notification from the hardware.
#[derive(Debug, Clone)]
pub enum NotifyMsg {
    /// The sensor started exposing frame `frame_number` at `timestamp`.
    Shutter { frame_number: FrameNumber, timestamp: i64 },
    Error {
        frame_number: FrameNumber,
        stream_id: Option<StreamId>,
        kind: HalErrorKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    Ok,
    Error,
}

/// One buffer travelling between the core and the hardware, tagged with
/// the stream it belongs to.
#[derive(Debug, Clone)]
pub struct StreamBuffer {
    pub stream_id: StreamId,
    pub buffer: GraphicBuffer,
    pub status: BufferStatus,
}

/// One capture-result delivery. A frame's result may arrive split across
/// several of these: partial metadata, final metadata, and buffers in any
/// combination, bounded by the declared partial-result ceiling.
#[derive(Debug, Clone)]
pub struct HalCaptureResult {
    pub frame_number: FrameNumber,
    /// 1-based partial index; equal to the declared ceiling for the final
    /// metadata chunk. 0 when this delivery carries no metadata.
    pub partial_result: u32,
    pub metadata: Option<CameraMetadata>,
    pub output_buffers: Vec<StreamBuffer>,
    pub input_buffer: Option<StreamBuffer>,
}

/// One request as submitted to the hardware.
#[derive(Debug, Clone)]
pub struct HalRequest {
    pub frame_number: FrameNumber,
    pub settings: CameraMetadata,
    pub input_buffer: Option<StreamBuffer>,
    pub output_buffers: Vec<StreamBuffer>,
}

/// Stream direction as seen by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Output,
    Input,
    Bidirectional,
}

/// Per-stream configuration handed to `configure_streams`. The hardware
/// may adjust `usage` and `max_buffers` before the core commits them in
/// each stream's `finish_configuration`.
#[derive(Debug, Clone)]
pub struct HalStreamConfig {
    pub stream_id: StreamId,
    pub kind: StreamKind,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub usage: BufferUsage,
    pub max_buffers: usize,
}

/// Callback sink the core hands to the hardware at initialization.
pub trait HalEvents: Send + Sync {
    fn notify(&self, msg: NotifyMsg);
    fn process_capture_result(&self, result: HalCaptureResult);
}

/// The hardware session the device core drives.
pub trait HalSession: Send + Sync {
    /// Open the session and register the callback sink. Fails if the
    /// interface version is incompatible.
    fn initialize(&self, events: Arc<dyn HalEvents>) -> Result<HalDeviceInfo>;

    /// Apply a stream configuration. The slice is two-way: the hardware
    /// may raise `usage`/`max_buffers` per stream before returning.
    /// A zero-length configuration is a contract violation.
    fn configure_streams(&self, streams: &mut [HalStreamConfig]) -> Result<()>;

    /// Default settings for a template, to be seeded into caller requests.
    fn construct_default_request_settings(
        &self,
        template: RequestTemplate,
    ) -> Result<CameraMetadata>;

    /// Submit one batch of requests. The hardware completes them
    /// asynchronously via the callback sink, preserving shutter order.
    fn process_capture_request(&self, requests: Vec<HalRequest>) -> Result<()>;

    /// Abort all in-flight work as fast as possible.
    fn flush(&self) -> Result<()>;

    /// Close the session; no callbacks may arrive afterwards.
    fn close(&self);
}
