use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use bytemuck::Pod;
use image::{ImageBuffer, Luma};
use ndarray::ArrayView2;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::ImageId;
use crate::arena::{Arena, ArenaError};
use crate::convert;
use crate::enums::{ElementType, ImageQualityStatus, LoadState};
use crate::metadata::ModalityLutModule;

/// Bookkeeping for one frame of a streaming volume.
#[derive(Debug)]
pub struct FrameSlot {
    index: usize,
    byte_offset: usize,
    status: AtomicU8,
    loading: AtomicBool,
    failed: AtomicBool,
}

impl FrameSlot {
    fn new(index: usize, byte_offset: usize) -> Self {
        Self {
            index,
            byte_offset,
            status: AtomicU8::new(0),
            loading: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    /// Quality of the data currently in the frame, `None` if nothing was written.
    pub fn status(&self) -> Option<ImageQualityStatus> {
        ImageQualityStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    // Only called while the frame's arena lock is held.
    fn set_status(&self, status: Option<ImageQualityStatus>) {
        let value = status.map_or(0, ImageQualityStatus::to_u8);
        self.status.store(value, Ordering::Release);
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    pub(crate) fn set_loading(&self, loading: bool) {
        self.loading.store(loading, Ordering::Release);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn set_failed(&self, failed: bool) {
        self.failed.store(failed, Ordering::Release);
    }
}

/// Result of offering data to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameWrite {
    Written,
    /// The frame already holds data of this quality or better.
    Rejected { current: ImageQualityStatus },
}

/// Geometry shared by every frame of a volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeGeometry {
    pub rows: u32,
    pub columns: u32,
    pub samples_per_pixel: u16,
    /// (row spacing, column spacing, slice spacing)
    pub spacing: (f32, f32, f32),
    pub element_type: ElementType,
    /// Applied to incoming pixels that are not already scaled.
    pub scaling: Option<ModalityLutModule>,
}

impl VolumeGeometry {
    pub fn frame_byte_length(&self) -> usize {
        self.rows as usize
            * self.columns as usize
            * self.samples_per_pixel.max(1) as usize
            * self.element_type.byte_size()
    }
}

/// Aggregate progress of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadStatus {
    pub state: LoadState,
    pub total: usize,
    pub loaded: usize,
    pub loading: usize,
    pub failed: usize,
}

impl LoadStatus {
    pub fn fraction_loaded(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.loaded as f64 / self.total as f64
    }

    pub fn done(&self) -> bool {
        self.state == LoadState::Done
    }
}

/// Volume whose frames are filled in progressively, in any order.
pub struct StreamingImageVolume {
    volume_id: String,
    image_ids: Vec<ImageId>,
    geometry: VolumeGeometry,
    arena: Arena,
    frames: Box<[FrameSlot]>,
    loaded_threshold: ImageQualityStatus,
    state: Mutex<LoadState>,
    active_load: Mutex<Option<(u64, CancellationToken)>>,
    next_load_id: AtomicU64,
}

impl fmt::Debug for StreamingImageVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingImageVolume")
            .field("volume_id", &self.volume_id)
            .field("frames", &self.frames.len())
            .field("geometry", &self.geometry)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl StreamingImageVolume {
    /// Build a volume over `arena`. The arena must hold one frame per image id.
    pub fn new(
        volume_id: impl Into<String>,
        image_ids: Vec<ImageId>,
        geometry: VolumeGeometry,
        arena: Arena,
        loaded_threshold: ImageQualityStatus,
    ) -> Result<Self, ArenaError> {
        if arena.frame_count() != image_ids.len() {
            return Err(ArenaError::FrameOutOfRange {
                index: image_ids.len(),
                frame_count: arena.frame_count(),
            });
        }
        if arena.frame_byte_length() != geometry.frame_byte_length() {
            return Err(ArenaError::LengthMismatch {
                expected: geometry.frame_byte_length(),
                actual: arena.frame_byte_length(),
            });
        }
        let frames = (0..image_ids.len())
            .map(|index| FrameSlot::new(index, index * arena.frame_byte_length()))
            .collect();
        Ok(Self {
            volume_id: volume_id.into(),
            image_ids,
            geometry,
            arena,
            frames,
            loaded_threshold,
            state: Mutex::new(LoadState::NotStarted),
            active_load: Mutex::new(None),
            next_load_id: AtomicU64::new(1),
        })
    }

    pub fn volume_id(&self) -> &str {
        &self.volume_id
    }

    pub fn image_ids(&self) -> &[ImageId] {
        &self.image_ids
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    pub fn element_type(&self) -> ElementType {
        self.geometry.element_type
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        (
            self.frames.len(),
            self.geometry.rows as usize,
            self.geometry.columns as usize,
        )
    }

    pub fn size_in_bytes(&self) -> usize {
        self.arena.byte_length()
    }

    pub fn frame(&self, index: usize) -> Result<&FrameSlot, ArenaError> {
        self.frames.get(index).ok_or(ArenaError::FrameOutOfRange {
            index,
            frame_count: self.frames.len(),
        })
    }

    pub fn frame_status(&self, index: usize) -> Option<ImageQualityStatus> {
        self.frames.get(index).and_then(FrameSlot::status)
    }

    /// Index of `image_id` within the volume.
    pub fn image_index(&self, image_id: &str) -> Option<usize> {
        self.image_ids.iter().position(|id| id == image_id)
    }

    pub fn state(&self) -> LoadState {
        *self.state.lock()
    }

    pub fn loaded_threshold(&self) -> ImageQualityStatus {
        self.loaded_threshold
    }

    /// Offer data of quality `status` for frame `index`.
    ///
    /// The status check and the write happen under the frame's lock, so a
    /// late low quality arrival can never overwrite better data. Real data
    /// clears the frame's failed flag; replicated data leaves it set.
    pub fn commit_frame_with(
        &self,
        index: usize,
        status: ImageQualityStatus,
        write: impl FnOnce(&mut [u8]) -> Result<(), ArenaError>,
    ) -> Result<FrameWrite, ArenaError> {
        let slot = self.frame(index)?;
        self.arena.with_frame_mut(index, |bytes| {
            let current = slot.status();
            match ImageQualityStatus::upgrade(current, status) {
                Some(next) => {
                    write(bytes)?;
                    slot.set_status(Some(next));
                    if !next.is_replicate() {
                        slot.set_failed(false);
                    }
                    Ok(FrameWrite::Written)
                }
                None => {
                    let current = current.unwrap_or(status);
                    trace!(
                        volume_id = %self.volume_id,
                        index,
                        %current,
                        offered = %status,
                        "Discarded frame data that would lower quality"
                    );
                    Ok(FrameWrite::Rejected { current })
                }
            }
        })?
    }

    pub fn commit_frame(
        &self,
        index: usize,
        status: ImageQualityStatus,
        bytes: &[u8],
    ) -> Result<FrameWrite, ArenaError> {
        let expected = self.arena.frame_byte_length();
        if bytes.len() != expected {
            return Err(ArenaError::LengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        self.commit_frame_with(index, status, |frame| {
            frame.copy_from_slice(bytes);
            Ok(())
        })
    }

    /// Forget the quality of frame `index` so any data may be written again.
    /// The bytes are left in place.
    pub fn invalidate_frame(&self, index: usize) -> Result<(), ArenaError> {
        let slot = self.frame(index)?;
        self.arena.with_frame_mut(index, |_| slot.set_status(None))?;
        debug!(volume_id = %self.volume_id, index, "Invalidated frame");
        Ok(())
    }

    pub fn load_status(&self) -> LoadStatus {
        let mut status = LoadStatus {
            state: self.state(),
            total: self.frames.len(),
            loaded: 0,
            loading: 0,
            failed: 0,
        };
        for slot in self.frames.iter() {
            if slot
                .status()
                .is_some_and(|quality| quality >= self.loaded_threshold)
            {
                status.loaded += 1;
            }
            if slot.is_loading() {
                status.loading += 1;
            }
            if slot.is_failed() {
                status.failed += 1;
            }
        }
        status
    }

    /// Mark the volume as loading under `token` and return the id of this load.
    pub(crate) fn begin_load(&self, token: CancellationToken) -> u64 {
        let load_id = self.next_load_id.fetch_add(1, Ordering::Relaxed);
        *self.active_load.lock() = Some((load_id, token));
        *self.state.lock() = LoadState::Loading;
        load_id
    }

    /// Record the end of load `load_id`. Loads superseded by a newer one
    /// leave the state alone.
    pub(crate) fn finish_load(&self, load_id: u64, state: LoadState) {
        let mut active = self.active_load.lock();
        if active.as_ref().is_some_and(|(id, _)| *id == load_id) {
            *active = None;
            *self.state.lock() = state;
        }
    }

    /// Cancel the load currently filling this volume, if any.
    pub fn cancel_load(&self) {
        if let Some((_, token)) = self.active_load.lock().as_ref() {
            token.cancel();
        }
    }

    /// Run `f` over frame `index` as a 2D (rows, columns) array.
    pub fn frame_view<T: Pod, R>(
        &self,
        index: usize,
        f: impl FnOnce(ArrayView2<'_, T>) -> R,
    ) -> Result<R, ArenaError> {
        let shape = (self.geometry.rows as usize, self.geometry.columns as usize);
        self.arena.with_frame_typed::<T, _>(index, |values| {
            ArrayView2::from_shape(shape, values)
                .map(f)
                .map_err(|_| ArenaError::LengthMismatch {
                    expected: shape.0 * shape.1,
                    actual: values.len(),
                })
        })?
    }

    /// 8-bit grayscale preview of frame `index`, min/max normalized.
    pub fn frame_preview(&self, index: usize) -> Result<ImageBuffer<Luma<u8>, Vec<u8>>, ArenaError> {
        let element_type = self.geometry.element_type;
        let values = self
            .arena
            .with_frame(index, |bytes| convert::to_f32(bytes, element_type))?;
        let pixels = convert::normalize_to_u8(&values);
        let actual = pixels.len();
        ImageBuffer::from_raw(self.geometry.columns, self.geometry.rows, pixels).ok_or(
            ArenaError::LengthMismatch {
                expected: self.geometry.rows as usize * self.geometry.columns as usize,
                actual,
            },
        )
    }
}

/// A frame of a volume offered to a loader as the destination for its output.
#[derive(Clone)]
pub struct FrameTarget {
    volume: Arc<StreamingImageVolume>,
    index: usize,
}

impl fmt::Debug for FrameTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameTarget")
            .field("volume_id", &self.volume.volume_id)
            .field("index", &self.index)
            .finish()
    }
}

impl FrameTarget {
    pub fn new(volume: Arc<StreamingImageVolume>, index: usize) -> Result<Self, ArenaError> {
        volume.frame(index)?;
        Ok(Self { volume, index })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn volume(&self) -> &Arc<StreamingImageVolume> {
        &self.volume
    }

    pub fn element_type(&self) -> ElementType {
        self.volume.element_type()
    }

    pub fn byte_length(&self) -> usize {
        self.volume.arena.frame_byte_length()
    }

    /// Whether raw pixels of `element_type` and `byte_length` can be written
    /// without conversion or scaling.
    pub fn accepts(&self, element_type: ElementType, byte_length: usize) -> bool {
        self.element_type() == element_type
            && self.byte_length() == byte_length
            && self
                .volume
                .geometry
                .scaling
                .is_none_or(|lut| lut.is_identity())
    }

    /// Whether this target is frame `index` of `volume`.
    pub fn is_frame_of(&self, volume: &Arc<StreamingImageVolume>, index: usize) -> bool {
        Arc::ptr_eq(&self.volume, volume) && self.index == index
    }

    pub fn write(
        &self,
        status: ImageQualityStatus,
        write: impl FnOnce(&mut [u8]) -> Result<(), ArenaError>,
    ) -> Result<FrameWrite, ArenaError> {
        self.volume.commit_frame_with(self.index, status, write)
    }

    pub fn read(&self) -> Result<Vec<u8>, ArenaError> {
        self.volume.arena.read_frame(self.index)
    }
}
