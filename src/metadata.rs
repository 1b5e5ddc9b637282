//! Key/value capture metadata carried by requests and results

use std::collections::BTreeMap;

use bytes::Bytes;

/// Numeric metadata tag, mirroring the hardware tag space.
pub type Tag = u32;

/// Well-known tags the pipeline itself reads or writes.
pub mod tags {
    use super::Tag;

    pub const REQUEST_ID: Tag = 0x0001;
    pub const SENSOR_TIMESTAMP: Tag = 0x0002;

    pub const CONTROL_AF_TRIGGER: Tag = 0x0010;
    pub const CONTROL_AF_TRIGGER_ID: Tag = 0x0011;
    pub const CONTROL_AE_PRECAPTURE_TRIGGER: Tag = 0x0012;
    pub const CONTROL_AE_PRECAPTURE_ID: Tag = 0x0013;

    /// Trigger-id value inserted when the caller supplied a trigger tag
    /// without its companion id, for hardware compatibility.
    pub const PLACEHOLDER_TRIGGER_ID: i32 = 0;
}

/// Autofocus trigger values for `CONTROL_AF_TRIGGER`.
pub mod af_trigger {
    pub const IDLE: i32 = 0;
    pub const START: i32 = 1;
    pub const CANCEL: i32 = 2;
}

/// Precapture trigger values for `CONTROL_AE_PRECAPTURE_TRIGGER`.
pub mod precapture_trigger {
    pub const IDLE: i32 = 0;
    pub const START: i32 = 1;
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    I32(i32),
    I64(i64),
    F32(f32),
    I32Array(Vec<i32>),
    Blob(Bytes),
}

/// Ordered tag → value map used for capture settings, partial results and
/// final result metadata. Cheap to merge; merging overwrites per-tag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CameraMetadata {
    entries: BTreeMap<Tag, MetadataValue>,
}

impl CameraMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.entries.contains_key(&tag)
    }

    pub fn set(&mut self, tag: Tag, value: MetadataValue) {
        self.entries.insert(tag, value);
    }

    pub fn set_i32(&mut self, tag: Tag, value: i32) {
        self.set(tag, MetadataValue::I32(value));
    }

    pub fn set_i64(&mut self, tag: Tag, value: i64) {
        self.set(tag, MetadataValue::I64(value));
    }

    pub fn get(&self, tag: Tag) -> Option<&MetadataValue> {
        self.entries.get(&tag)
    }

    pub fn get_i32(&self, tag: Tag) -> Option<i32> {
        match self.entries.get(&tag) {
            Some(MetadataValue::I32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_i64(&self, tag: Tag) -> Option<i64> {
        match self.entries.get(&tag) {
            Some(MetadataValue::I64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn remove(&mut self, tag: Tag) -> Option<MetadataValue> {
        self.entries.remove(&tag)
    }

    /// Merge `other` into `self`, overwriting tags present in both.
    pub fn merge(&mut self, other: &CameraMetadata) {
        for (tag, value) in &other.entries {
            self.entries.insert(*tag, value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Tag, &MetadataValue)> {
        self.entries.iter()
    }
}
