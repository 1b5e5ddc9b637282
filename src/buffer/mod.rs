//! Graphics buffer handles and the shared buffer-set manager

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CameraError, Result};
use crate::stream::StreamId;

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    Nv12,
    /// Opaque implementation-defined format (ZSL / reprocessing paths).
    RawOpaque,
}

impl PixelFormat {
    /// Worst-case bytes per pixel, used to size backing allocations.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Yuyv4 => 2,
            PixelFormat::Mjpeg => 1,
            PixelFormat::Nv12 => 2,
            PixelFormat::RawOpaque => 4,
        }
    }
}

bitflags! {
    /// Usage flags negotiated between streams and the hardware.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufferUsage: u32 {
        const CPU_READ       = 1 << 0;
        const CPU_WRITE      = 1 << 1;
        const GPU_TEXTURE    = 1 << 2;
        const GPU_RENDER     = 1 << 3;
        const HW_CAMERA_READ = 1 << 4;
        const HW_CAMERA_WRITE = 1 << 5;
        const HW_COMPOSER    = 1 << 6;
        const VIDEO_ENCODER  = 1 << 7;
    }
}

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one graphics buffer.
///
/// Identity (not content) equality: clones share the same backing `Bytes`
/// and compare equal by id, mirroring handle semantics of a real gralloc
/// buffer. The payload is zero-copy shareable across threads.
#[derive(Debug, Clone)]
pub struct GraphicBuffer {
    id: u64,
    width: u32,
    height: u32,
    format: PixelFormat,
    usage: BufferUsage,
    data: Bytes,
}

impl GraphicBuffer {
    /// Allocate a fresh zeroed buffer.
    pub fn allocate(width: u32, height: u32, format: PixelFormat, usage: BufferUsage) -> Self {
        let size = width as usize * height as usize * format.bytes_per_pixel();
        Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            width,
            height,
            format,
            usage,
            data: Bytes::from(vec![0u8; size]),
        }
    }

    /// Wrap externally produced data in a buffer handle.
    pub fn from_data(
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: BufferUsage,
        data: Bytes,
    ) -> Self {
        Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            width,
            height,
            format,
            usage,
            data,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

impl PartialEq for GraphicBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for GraphicBuffer {}

/// Buffer-sharing group id, assigned by the caller at stream creation.
pub type SetId = i32;

/// Per-stream registration info inside a buffer set.
#[derive(Debug, Clone)]
pub struct StreamBufferInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub usage: BufferUsage,
    /// Declared maximum buffers this stream may have outstanding.
    pub total_buffer_count: usize,
}

struct FreeBuffer {
    /// Stream the buffer was last handed to; used to pick a trim victim
    /// that is not the stream currently being served.
    last_owner: StreamId,
    buffer: GraphicBuffer,
}

#[derive(Default)]
struct SetState {
    infos: HashMap<StreamId, StreamBufferInfo>,
    handed_out: HashMap<StreamId, usize>,
    free: Vec<FreeBuffer>,
    /// Buffers alive for this set: free + handed out.
    allocated: usize,
    /// Max of all member streams' declared buffer counts.
    water_mark: usize,
}

impl SetState {
    fn recompute_water_mark(&mut self) {
        self.water_mark = self
            .infos
            .values()
            .map(|i| i.total_buffer_count)
            .max()
            .unwrap_or(0);
    }
}

/// Pool manager handing out and reclaiming graphics buffers across sets of
/// streams that agree to share buffers.
///
/// Each set keeps its allocation bounded by a high-water mark: the max of
/// the member streams' declared buffer counts. Every allocation that
/// pushes the set over the mark immediately frees one free buffer
/// belonging to another member stream.
pub struct BufferManager {
    sets: Mutex<HashMap<SetId, SetState>>,
}

impl Default for BufferManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferManager {
    pub fn new() -> Self {
        Self {
            sets: Mutex::new(HashMap::new()),
        }
    }

    /// Add a stream to a buffer-sharing set, recomputing the water mark.
    pub fn register_stream(
        &self,
        stream_id: StreamId,
        set_id: SetId,
        info: StreamBufferInfo,
    ) -> Result<()> {
        if info.total_buffer_count == 0 {
            return Err(CameraError::BadParameter(format!(
                "stream {stream_id} registered with zero buffer count"
            )));
        }
        let mut sets = self.sets.lock().unwrap();
        let set = sets.entry(set_id).or_default();
        if set.infos.contains_key(&stream_id) {
            return Err(CameraError::BadParameter(format!(
                "stream {stream_id} already registered in set {set_id}"
            )));
        }
        set.infos.insert(stream_id, info);
        set.handed_out.insert(stream_id, 0);
        set.recompute_water_mark();
        debug!(
            stream_id,
            set_id,
            water_mark = set.water_mark,
            "registered stream with buffer manager"
        );
        Ok(())
    }

    /// Replace a registered stream's info after a reconfiguration changed
    /// its negotiated buffer count or usage; recomputes the water mark.
    pub fn update_stream(
        &self,
        stream_id: StreamId,
        set_id: SetId,
        info: StreamBufferInfo,
    ) -> Result<()> {
        if info.total_buffer_count == 0 {
            return Err(CameraError::BadParameter(format!(
                "stream {stream_id} updated with zero buffer count"
            )));
        }
        let mut sets = self.sets.lock().unwrap();
        let Some(set) = sets.get_mut(&set_id) else {
            return Err(CameraError::BadParameter(format!("no buffer set {set_id}")));
        };
        let Some(slot) = set.infos.get_mut(&stream_id) else {
            return Err(CameraError::BadStreamId(stream_id));
        };
        *slot = info;
        set.recompute_water_mark();
        debug!(
            stream_id,
            set_id,
            water_mark = set.water_mark,
            "updated stream registration"
        );
        Ok(())
    }

    /// Remove a stream from its set. Buffers it still holds are dropped
    /// when returned (teardown races are expected, see `return_buffer`).
    pub fn unregister_stream(&self, stream_id: StreamId, set_id: SetId) -> Result<()> {
        let mut sets = self.sets.lock().unwrap();
        let Some(set) = sets.get_mut(&set_id) else {
            return Err(CameraError::BadParameter(format!("no buffer set {set_id}")));
        };
        if set.infos.remove(&stream_id).is_none() {
            return Err(CameraError::BadStreamId(stream_id));
        }
        set.handed_out.remove(&stream_id);
        // Free buffers last handed to the departing stream are no longer
        // sized/usaged for anyone in particular; keep them, they remain
        // format-compatible within the set by construction.
        set.recompute_water_mark();
        if set.infos.is_empty() {
            set.allocated = 0;
            sets.remove(&set_id);
        }
        Ok(())
    }

    /// Hand one buffer to `stream_id`, reusing a free buffer when possible.
    pub fn get_buffer_for_stream(&self, stream_id: StreamId, set_id: SetId) -> Result<GraphicBuffer> {
        let mut sets = self.sets.lock().unwrap();
        let set = sets
            .get_mut(&set_id)
            .ok_or_else(|| CameraError::BadParameter(format!("no buffer set {set_id}")))?;
        let info = set
            .infos
            .get(&stream_id)
            .ok_or(CameraError::BadStreamId(stream_id))?
            .clone();
        let count = set.handed_out.get_mut(&stream_id).ok_or(CameraError::BadStreamId(stream_id))?;
        if *count >= info.total_buffer_count {
            return Err(CameraError::BufferLimit {
                stream: stream_id,
                max: info.total_buffer_count,
            });
        }

        let buffer = match set.free.pop() {
            Some(free) => free.buffer,
            None => {
                set.allocated += 1;
                GraphicBuffer::allocate(info.width, info.height, info.format, info.usage)
            }
        };
        *count += 1;

        // Defensive trim: keep the set at or below its water mark by
        // releasing a free buffer last owned by a different, less active
        // member stream.
        if set.allocated > set.water_mark {
            let handed_out = set.handed_out.clone();
            let victim = set
                .free
                .iter()
                .enumerate()
                .filter(|(_, f)| f.last_owner != stream_id)
                .min_by_key(|(_, f)| handed_out.get(&f.last_owner).copied().unwrap_or(0))
                .map(|(idx, _)| idx);
            if let Some(idx) = victim {
                let freed = set.free.swap_remove(idx);
                set.allocated -= 1;
                debug!(
                    set_id,
                    victim_owner = freed.last_owner,
                    allocated = set.allocated,
                    water_mark = set.water_mark,
                    "trimmed buffer set over water mark"
                );
            }
        }

        Ok(buffer)
    }

    /// Return a buffer to the set's free list.
    ///
    /// Returning for an already-unregistered stream silently drops the
    /// buffer; teardown can race buffer return from a consumer thread.
    pub fn return_buffer_for_stream(&self, stream_id: StreamId, set_id: SetId, buffer: GraphicBuffer) {
        let mut sets = self.sets.lock().unwrap();
        let Some(set) = sets.get_mut(&set_id) else {
            debug!(stream_id, set_id, "buffer returned for torn-down set, dropping");
            return;
        };
        if !set.infos.contains_key(&stream_id) {
            debug!(stream_id, set_id, "buffer returned for unregistered stream, dropping");
            if set.allocated > 0 {
                set.allocated -= 1;
            }
            return;
        }
        match set.handed_out.get_mut(&stream_id) {
            Some(count) if *count > 0 => *count -= 1,
            _ => warn!(stream_id, set_id, "buffer return without matching hand-out"),
        }
        set.free.push(FreeBuffer {
            last_owner: stream_id,
            buffer,
        });
    }

    /// (free, allocated, water_mark) for a set; test/diagnostic hook.
    pub fn set_stats(&self, set_id: SetId) -> Option<(usize, usize, usize)> {
        let sets = self.sets.lock().unwrap();
        sets.get(&set_id)
            .map(|s| (s.free.len(), s.allocated, s.water_mark))
    }

    /// Count of buffers currently handed out to a stream.
    pub fn handed_out_count(&self, stream_id: StreamId, set_id: SetId) -> usize {
        let sets = self.sets.lock().unwrap();
        sets.get(&set_id)
            .and_then(|s| s.handed_out.get(&stream_id).copied())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(count: usize) -> StreamBufferInfo {
        StreamBufferInfo {
            width: 640,
            height: 480,
            format: PixelFormat::Nv12,
            usage: BufferUsage::HW_CAMERA_WRITE,
            total_buffer_count: count,
        }
    }

    #[test]
    fn water_mark_is_max_of_members() {
        let mgr = BufferManager::new();
        mgr.register_stream(0, 7, info(4)).unwrap();
        mgr.register_stream(1, 7, info(2)).unwrap();
        assert_eq!(mgr.set_stats(7).unwrap().2, 4);

        mgr.unregister_stream(0, 7).unwrap();
        assert_eq!(mgr.set_stats(7).unwrap().2, 2);
    }

    #[test]
    fn update_recomputes_water_mark() {
        let mgr = BufferManager::new();
        mgr.register_stream(0, 7, info(4)).unwrap();
        mgr.register_stream(1, 7, info(2)).unwrap();
        assert_eq!(mgr.set_stats(7).unwrap().2, 4);

        mgr.update_stream(0, 7, info(6)).unwrap();
        assert_eq!(mgr.set_stats(7).unwrap().2, 6);
        mgr.update_stream(0, 7, info(1)).unwrap();
        assert_eq!(mgr.set_stats(7).unwrap().2, 2);

        assert!(mgr.update_stream(9, 7, info(3)).is_err());
    }

    #[test]
    fn reuses_free_buffer_before_allocating() {
        let mgr = BufferManager::new();
        mgr.register_stream(0, 1, info(4)).unwrap();
        mgr.register_stream(1, 1, info(2)).unwrap();

        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(mgr.get_buffer_for_stream(0, 1).unwrap());
        }
        assert_eq!(mgr.set_stats(1).unwrap().1, 4);

        let returned = held.pop().unwrap();
        let returned_id = returned.id();
        mgr.return_buffer_for_stream(0, 1, returned);

        // The under-served stream gets the freed buffer back, not a fresh
        // allocation.
        let reused = mgr.get_buffer_for_stream(1, 1).unwrap();
        assert_eq!(reused.id(), returned_id);
        assert_eq!(mgr.set_stats(1).unwrap().1, 4);
    }

    #[test]
    fn hand_out_capped_at_declared_count() {
        let mgr = BufferManager::new();
        mgr.register_stream(3, 2, info(2)).unwrap();
        let _a = mgr.get_buffer_for_stream(3, 2).unwrap();
        let _b = mgr.get_buffer_for_stream(3, 2).unwrap();
        assert!(matches!(
            mgr.get_buffer_for_stream(3, 2),
            Err(CameraError::BufferLimit { stream: 3, max: 2 })
        ));
    }

    #[test]
    fn return_after_unregister_is_silent() {
        let mgr = BufferManager::new();
        mgr.register_stream(0, 5, info(2)).unwrap();
        mgr.register_stream(1, 5, info(2)).unwrap();
        let buf = mgr.get_buffer_for_stream(0, 5).unwrap();
        mgr.unregister_stream(0, 5).unwrap();
        // No panic, no error; buffer is dropped.
        mgr.return_buffer_for_stream(0, 5, buf);
        assert_eq!(mgr.handed_out_count(0, 5), 0);
    }

    #[test]
    fn over_water_mark_trims_other_streams_free_buffer() {
        let mgr = BufferManager::new();
        mgr.register_stream(0, 9, info(2)).unwrap();
        mgr.register_stream(1, 9, info(2)).unwrap();

        // Allocate two for each stream: 4 allocated vs water mark 2.
        // The cap check keeps per-stream hand-outs legal, but the set as a
        // whole overshoots; returns followed by a new hand-out must trim.
        let a0 = mgr.get_buffer_for_stream(0, 9).unwrap();
        let a1 = mgr.get_buffer_for_stream(0, 9).unwrap();
        let b0 = mgr.get_buffer_for_stream(1, 9).unwrap();
        let b1 = mgr.get_buffer_for_stream(1, 9).unwrap();
        assert_eq!(mgr.set_stats(9).unwrap().1, 4);

        mgr.return_buffer_for_stream(0, 9, a0);
        mgr.return_buffer_for_stream(0, 9, a1);
        mgr.return_buffer_for_stream(1, 9, b0);
        mgr.return_buffer_for_stream(1, 9, b1);

        // Next hand-out reuses a free buffer and trims one belonging to
        // the other stream, pulling allocation back toward the mark.
        let _c = mgr.get_buffer_for_stream(0, 9).unwrap();
        let (_, allocated, water_mark) = mgr.set_stats(9).unwrap();
        assert!(allocated <= water_mark + 1);
    }
}
