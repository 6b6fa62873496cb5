use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crop {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Crop {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelLayout {
    #[default]
    Nv12,
    P010,
    Rgb4,
}

impl PixelLayout {
    pub fn frame_bytes(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            Self::Nv12 => pixels * 3 / 2,
            Self::P010 => pixels * 3,
            Self::Rgb4 => pixels * 4,
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "nv12" => Some(Self::Nv12),
            "p010" => Some(Self::P010),
            "rgb4" | "rgba" | "bgra" => Some(Self::Rgb4),
            _ => None,
        }
    }
}

/// Allocation geometry of a surface plus the region a stage should read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub crop: Crop,
    pub layout: PixelLayout,
}

impl FrameInfo {
    /// Surfaces are allocated on 16-pixel boundaries; the crop keeps the
    /// visible size.
    pub fn new(width: u32, height: u32, layout: PixelLayout) -> Self {
        Self {
            width: align16(width),
            height: align16(height),
            crop: Crop::full(width, height),
            layout,
        }
    }

    pub fn visible_size(&self) -> (u32, u32) {
        (self.crop.width, self.crop.height)
    }
}

fn align16(value: u32) -> u32 {
    value.div_ceil(16) * 16
}

/// Per-frame metadata carried by a surface while it travels the chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameMeta {
    pub pts: i64,
    pub sequence: u64,
    pub source_index: u64,
    /// Set on the synthesized half of a frame-rate doubling pair.
    pub companion: bool,
}

struct SlotData {
    info: FrameInfo,
    meta: FrameMeta,
    payload: Vec<u8>,
}

struct Slot {
    locked: AtomicU32,
    data: Mutex<SlotData>,
}

struct PoolShared {
    name: String,
    nominal: FrameInfo,
    slots: Vec<Slot>,
}

/// Fixed-capacity set of reusable surfaces shared across one stage boundary.
#[derive(Clone)]
pub struct SurfacePool {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for SurfacePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfacePool")
            .field("name", &self.shared.name)
            .field("capacity", &self.capacity())
            .field("free", &self.free_count())
            .finish()
    }
}

impl SurfacePool {
    pub fn allocate(name: impl Into<String>, capacity: usize, nominal: FrameInfo) -> Self {
        let name = name.into();
        let slots = (0..capacity)
            .map(|_| Slot {
                locked: AtomicU32::new(0),
                data: Mutex::new(SlotData {
                    info: nominal,
                    meta: FrameMeta::default(),
                    payload: Vec::new(),
                }),
            })
            .collect();
        debug!(pool = name.as_str(), capacity, ?nominal, "Allocated surface pool");
        Self {
            shared: Arc::new(PoolShared {
                name,
                nominal,
                slots,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.shared
            .slots
            .iter()
            .filter(|slot| slot.locked.load(Ordering::Acquire) == 0)
            .count()
    }

    /// Claims an unlocked surface. Metadata is reset and the geometry goes
    /// back to the pool's nominal format; the producer writes the real one.
    pub fn checkout(&self) -> Option<SurfaceLease> {
        for (index, slot) in self.shared.slots.iter().enumerate() {
            if slot
                .locked
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let mut data = slot.data.lock();
                data.info = self.shared.nominal;
                data.meta = FrameMeta::default();
                data.payload.clear();
                drop(data);
                return Some(SurfaceLease {
                    pool: self.shared.clone(),
                    index,
                });
            }
        }
        None
    }
}

/// A counted hand-off of one surface.
///
/// Every live lease holds one unit of the surface's lock count. Cloning a
/// lease is how a stage keeps a surface beyond a single call; dropping it
/// is the matching release.
pub struct SurfaceLease {
    pool: Arc<PoolShared>,
    index: usize,
}

impl SurfaceLease {
    fn slot(&self) -> &Slot {
        &self.pool.slots[self.index]
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }

    pub fn lock_count(&self) -> u32 {
        self.slot().locked.load(Ordering::Acquire)
    }

    pub fn info(&self) -> FrameInfo {
        self.slot().data.lock().info
    }

    pub fn set_info(&self, info: FrameInfo) {
        self.slot().data.lock().info = info;
    }

    pub fn set_crop(&self, crop: Crop) {
        self.slot().data.lock().info.crop = crop;
    }

    pub fn meta(&self) -> FrameMeta {
        self.slot().data.lock().meta
    }

    pub fn set_meta(&self, meta: FrameMeta) {
        self.slot().data.lock().meta = meta;
    }

    pub fn update_meta(&self, update: impl FnOnce(&mut FrameMeta)) {
        update(&mut self.slot().data.lock().meta);
    }

    pub fn with_payload<R>(&self, read: impl FnOnce(&[u8]) -> R) -> R {
        read(&self.slot().data.lock().payload)
    }

    pub fn write_payload(&self, write: impl FnOnce(&mut Vec<u8>)) {
        write(&mut self.slot().data.lock().payload);
    }
}

impl Clone for SurfaceLease {
    fn clone(&self) -> Self {
        self.slot().locked.fetch_add(1, Ordering::AcqRel);
        Self {
            pool: self.pool.clone(),
            index: self.index,
        }
    }
}

impl Drop for SurfaceLease {
    fn drop(&mut self) {
        self.slot().locked.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for SurfaceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceLease")
            .field("pool", &self.pool.name)
            .field("index", &self.index)
            .field("locked", &self.lock_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_clone_and_drop_pair_lock_counts() {
        let pool = SurfacePool::allocate("test", 2, FrameInfo::new(64, 36, PixelLayout::Nv12));
        let first = pool.checkout().unwrap();
        assert_eq!(first.lock_count(), 1);
        let retained = first.clone();
        assert_eq!(first.lock_count(), 2);
        drop(first);
        assert_eq!(retained.lock_count(), 1);
        assert_eq!(pool.free_count(), 1);
        drop(retained);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let pool = SurfacePool::allocate("test", 1, FrameInfo::new(16, 16, PixelLayout::Nv12));
        let held = pool.checkout().unwrap();
        assert!(pool.checkout().is_none());
        drop(held);
        assert!(pool.checkout().is_some());
    }

    #[test]
    fn allocation_geometry_is_aligned() {
        let info = FrameInfo::new(1920, 1080, PixelLayout::Nv12);
        assert_eq!(info.height, 1088);
        assert_eq!(info.visible_size(), (1920, 1080));
    }
}
