//! Voxel storage for one volume, addressed by frame.
//!
//! An [`Arena`] holds `frame_count * frame_byte_length` bytes. With
//! [`AllocationStrategy::Shared`] every frame is its own buffer behind its own
//! lock, so decoders running on different tasks can fill different frames at
//! the same time without copying through an intermediate buffer. The private
//! fallback is one buffer behind a single lock, with the same API.

use std::ops::Range;
use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

use crate::enums::{AllocationStrategy, ElementType};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArenaError {
    #[error("Unable to allocate {requested} bytes for arena")]
    OutOfMemory { requested: usize },

    #[error("Frame {index} out of range (arena holds {frame_count} frames)")]
    FrameOutOfRange { index: usize, frame_count: usize },

    #[error("Frame expects {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Frame bytes are not aligned for the requested element type")]
    Misaligned,
}

enum Storage {
    /// One word buffer per frame.
    Shared(Box<[RwLock<Box<[u64]>>]>),
    Private(Mutex<Box<[u64]>>),
}

fn zeroed_words(word_count: usize, byte_length: usize) -> Result<Box<[u64]>, ArenaError> {
    let mut words = Vec::new();
    words
        .try_reserve_exact(word_count)
        .map_err(|_| ArenaError::OutOfMemory {
            requested: byte_length,
        })?;
    words.resize(word_count, 0u64);
    Ok(words.into_boxed_slice())
}

struct ArenaInner {
    storage: Storage,
    frame_count: usize,
    frame_byte_length: usize,
    element_type: ElementType,
}

/// Reference counted voxel buffer of one volume.
///
/// Cloning an arena adds a holder; the memory is freed once the last holder
/// is dropped or [`release`](Arena::release)d.
#[derive(Clone)]
pub struct Arena {
    inner: Arc<ArenaInner>,
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("frame_count", &self.inner.frame_count)
            .field("frame_byte_length", &self.inner.frame_byte_length)
            .field("element_type", &self.inner.element_type)
            .field("strategy", &self.strategy())
            .finish()
    }
}

impl Arena {
    /// Allocate a zeroed arena.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::OutOfMemory`] if the total size overflows,
    /// exceeds `shared_limit` for a shared arena, or the allocator refuses.
    pub fn allocate(
        frame_count: usize,
        frame_byte_length: usize,
        element_type: ElementType,
        strategy: AllocationStrategy,
        shared_limit: Option<usize>,
    ) -> Result<Self, ArenaError> {
        let byte_length = frame_count
            .checked_mul(frame_byte_length)
            .ok_or(ArenaError::OutOfMemory {
                requested: usize::MAX,
            })?;

        let storage = match strategy {
            AllocationStrategy::Shared => {
                if shared_limit.is_some_and(|limit| byte_length > limit) {
                    return Err(ArenaError::OutOfMemory {
                        requested: byte_length,
                    });
                }
                let frame_words = frame_byte_length.div_ceil(8);
                let mut frames = Vec::new();
                frames
                    .try_reserve_exact(frame_count)
                    .map_err(|_| ArenaError::OutOfMemory {
                        requested: byte_length,
                    })?;
                for _ in 0..frame_count {
                    frames.push(RwLock::new(zeroed_words(frame_words, byte_length)?));
                }
                Storage::Shared(frames.into_boxed_slice())
            }
            AllocationStrategy::Private => Storage::Private(Mutex::new(zeroed_words(
                byte_length.div_ceil(8),
                byte_length,
            )?)),
        };

        debug!(
            frame_count,
            frame_byte_length,
            byte_length,
            ?strategy,
            "Allocated arena"
        );

        Ok(Self {
            inner: Arc::new(ArenaInner {
                storage,
                frame_count,
                frame_byte_length,
                element_type,
            }),
        })
    }

    /// Allocate with `preferred`, dropping to a private buffer if a shared
    /// one cannot be had.
    pub fn allocate_with_fallback(
        frame_count: usize,
        frame_byte_length: usize,
        element_type: ElementType,
        preferred: AllocationStrategy,
        shared_limit: Option<usize>,
    ) -> Result<Self, ArenaError> {
        match Self::allocate(
            frame_count,
            frame_byte_length,
            element_type,
            preferred,
            shared_limit,
        ) {
            Err(ArenaError::OutOfMemory { requested })
                if preferred == AllocationStrategy::Shared =>
            {
                warn!(
                    requested,
                    "Shared arena allocation failed, falling back to private buffer"
                );
                Self::allocate(
                    frame_count,
                    frame_byte_length,
                    element_type,
                    AllocationStrategy::Private,
                    None,
                )
            }
            result => result,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.inner.frame_count
    }

    pub fn frame_byte_length(&self) -> usize {
        self.inner.frame_byte_length
    }

    pub fn byte_length(&self) -> usize {
        self.inner.frame_count * self.inner.frame_byte_length
    }

    pub fn element_type(&self) -> ElementType {
        self.inner.element_type
    }

    pub fn strategy(&self) -> AllocationStrategy {
        match self.inner.storage {
            Storage::Shared(_) => AllocationStrategy::Shared,
            Storage::Private(_) => AllocationStrategy::Private,
        }
    }

    /// Whether decoders may be handed a target inside this arena.
    pub fn supports_direct_write(&self) -> bool {
        matches!(self.inner.storage, Storage::Shared(_))
    }

    /// Byte offset of frame `index` from the start of the arena.
    pub fn frame_offset(&self, index: usize) -> Result<usize, ArenaError> {
        self.check_index(index)?;
        Ok(index * self.inner.frame_byte_length)
    }

    /// Number of live holders of this arena's memory.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Drop this holder's reference.
    pub fn release(self) {
        debug!(holders = self.holders() - 1, "Released arena holder");
    }

    fn check_index(&self, index: usize) -> Result<(), ArenaError> {
        if index >= self.inner.frame_count {
            return Err(ArenaError::FrameOutOfRange {
                index,
                frame_count: self.inner.frame_count,
            });
        }
        Ok(())
    }

    /// Byte range of frame `index` within the private buffer.
    fn frame_range(&self, index: usize) -> Result<Range<usize>, ArenaError> {
        let start = self.frame_offset(index)?;
        Ok(start..start + self.inner.frame_byte_length)
    }

    /// Run `f` with exclusive access to the bytes of frame `index`.
    ///
    /// Writers of the same frame are serialized; writers of different frames
    /// of a shared arena run concurrently.
    pub fn with_frame_mut<R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, ArenaError> {
        let range = self.frame_range(index)?;
        match &self.inner.storage {
            Storage::Shared(frames) => {
                let mut words = frames[index].write();
                let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words[..]);
                Ok(f(&mut bytes[..range.len()]))
            }
            Storage::Private(private) => {
                let mut words = private.lock();
                let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words[..]);
                Ok(f(&mut bytes[range]))
            }
        }
    }

    /// Run `f` with shared access to the bytes of frame `index`.
    pub fn with_frame<R>(&self, index: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R, ArenaError> {
        let range = self.frame_range(index)?;
        match &self.inner.storage {
            Storage::Shared(frames) => {
                let words = frames[index].read();
                let bytes: &[u8] = bytemuck::cast_slice(&words[..]);
                Ok(f(&bytes[..range.len()]))
            }
            Storage::Private(private) => {
                let words = private.lock();
                let bytes: &[u8] = bytemuck::cast_slice(&words[..]);
                Ok(f(&bytes[range]))
            }
        }
    }

    /// Typed mutable view over frame `index`.
    pub fn with_frame_typed_mut<T: Pod, R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut [T]) -> R,
    ) -> Result<R, ArenaError> {
        self.with_frame_mut(index, |bytes| {
            bytemuck::try_cast_slice_mut::<u8, T>(bytes)
                .map(f)
                .map_err(|_| ArenaError::Misaligned)
        })?
    }

    /// Typed view over frame `index`.
    pub fn with_frame_typed<T: Pod, R>(
        &self,
        index: usize,
        f: impl FnOnce(&[T]) -> R,
    ) -> Result<R, ArenaError> {
        self.with_frame(index, |bytes| {
            bytemuck::try_cast_slice::<u8, T>(bytes)
                .map(f)
                .map_err(|_| ArenaError::Misaligned)
        })?
    }

    /// Copy `bytes` into frame `index`. The length must match the frame size.
    pub fn write_frame(&self, index: usize, bytes: &[u8]) -> Result<(), ArenaError> {
        let expected = self.inner.frame_byte_length;
        if bytes.len() != expected {
            return Err(ArenaError::LengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        self.with_frame_mut(index, |frame| frame.copy_from_slice(bytes))
    }

    /// Copy of the bytes of frame `index`.
    pub fn read_frame(&self, index: usize) -> Result<Vec<u8>, ArenaError> {
        self.with_frame(index, <[u8]>::to_vec)
    }
}
