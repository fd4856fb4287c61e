//! The fetch/decode collaborator consumed by the request pool.
//!
//! This crate does not fetch or decode pixel data itself. An [`ImageLoader`]
//! turns an image id into a [`DecodedImage`], either returning the bytes or
//! writing them straight into a [`FrameTarget`] when one is offered.

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};

use dicom::object::open_file;
use dicom::pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder};
use futures::FutureExt;
use futures::future::BoxFuture;
use ndarray::s;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::ImageId;
use crate::arena::ArenaError;
use crate::enums::{ElementType, ImageQualityStatus, RequestType};
use crate::volume::{FrameTarget, FrameWrite};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    /// Network or timeout class failure, worth retrying.
    #[error("Transient load failure: {reason}")]
    Transient { reason: String },

    /// Missing or malformed data. Retrying will not help.
    #[error("Permanent load failure: {reason}")]
    Permanent { reason: String },

    #[error("Load cancelled")]
    Cancelled,
}

impl LoadError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Transient { reason } | Self::Permanent { reason } => reason,
            Self::Cancelled => "cancelled",
        }
    }
}

/// Where decoded pixels ended up.
#[derive(Clone)]
pub enum PixelData {
    Owned(Vec<u8>),
    /// Offered to a volume frame by the loader. `write` is what the frame's
    /// quality gate made of it.
    InTarget { target: FrameTarget, write: FrameWrite },
}

impl fmt::Debug for PixelData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owned(bytes) => f.debug_tuple("Owned").field(&bytes.len()).finish(),
            Self::InTarget { target, write } => f
                .debug_struct("InTarget")
                .field("target", target)
                .field("write", write)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub image_id: ImageId,
    pub rows: u32,
    pub columns: u32,
    pub element_type: ElementType,
    pub status: ImageQualityStatus,
    /// Modality LUT already applied by the loader.
    pub scaled: bool,
    pub pixels: PixelData,
}

impl DecodedImage {
    pub fn owned(
        image_id: impl Into<ImageId>,
        rows: u32,
        columns: u32,
        element_type: ElementType,
        status: ImageQualityStatus,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            image_id: image_id.into(),
            rows,
            columns,
            element_type,
            status,
            scaled: false,
            pixels: PixelData::Owned(bytes),
        }
    }

    /// Image whose pixels the loader offered to `target`, with the outcome
    /// of that write.
    pub fn in_target(
        image_id: impl Into<ImageId>,
        rows: u32,
        columns: u32,
        element_type: ElementType,
        status: ImageQualityStatus,
        target: FrameTarget,
        write: FrameWrite,
    ) -> Self {
        Self {
            image_id: image_id.into(),
            rows,
            columns,
            element_type,
            status,
            scaled: false,
            pixels: PixelData::InTarget { target, write },
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        self.rows as usize * self.columns as usize * self.element_type.byte_size()
    }

    /// Pixel bytes, read back from the target frame when the loader wrote
    /// them there.
    pub fn bytes(&self) -> Result<Cow<'_, [u8]>, ArenaError> {
        match &self.pixels {
            PixelData::Owned(bytes) => Ok(Cow::Borrowed(bytes)),
            PixelData::InTarget { target, .. } => target.read().map(Cow::Owned),
        }
    }

    /// Copy of this image that holds its own pixels, detached from any
    /// volume it was written into.
    pub fn to_owned_pixels(&self) -> Result<Self, ArenaError> {
        Ok(Self {
            image_id: self.image_id.clone(),
            rows: self.rows,
            columns: self.columns,
            element_type: self.element_type,
            status: self.status,
            scaled: self.scaled,
            pixels: PixelData::Owned(self.bytes()?.into_owned()),
        })
    }
}

/// Per-request parameters handed to the loader.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub request_type: RequestType,
    pub priority: i32,
    /// Frame the decoded bytes may be written into.
    pub target: Option<FrameTarget>,
    /// Triggered when nobody is waiting for the result any more.
    pub cancel: CancellationToken,
}

/// Fetches and decodes one image.
pub trait ImageLoader: Send + Sync {
    fn load(
        &self,
        image_id: &str,
        options: LoadOptions,
    ) -> BoxFuture<'static, Result<DecodedImage, LoadError>>;
}

/// Loads image ids as paths of DICOM files relative to a root directory.
///
/// Decoding runs on the blocking pool. The first frame of each file is used
/// and stored values are returned unscaled, leaving the modality LUT to the
/// volume they are written into.
pub struct DicomFileLoader {
    root: PathBuf,
}

impl DicomFileLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Decode the stored values of the first frame and first sample, without
    /// modality or VOI LUT.
    fn decode_file(path: &Path) -> Result<RawFrame, LoadError> {
        if !path.exists() {
            return Err(LoadError::permanent(format!(
                "{} does not exist",
                path.display()
            )));
        }
        let dicom_object =
            open_file(path).map_err(|err| LoadError::permanent(err.to_string()))?;
        let pixel_data = dicom_object
            .decode_pixel_data()
            .map_err(|err| LoadError::permanent(err.to_string()))?;
        let bits_allocated = pixel_data.bits_allocated();
        let element_type = ElementType::from_pixel_format(
            bits_allocated,
            pixel_data.pixel_representation() as u16,
        )
        .ok_or_else(|| {
            LoadError::permanent(format!("unsupported bits allocated: {bits_allocated}"))
        })?;
        let options = ConvertOptions::new().with_modality_lut(ModalityLutOption::None);

        macro_rules! frame_bytes {
            ($ty:ty) => {{
                let frame = pixel_data
                    .to_ndarray_frame_with_options::<$ty>(0, &options)
                    .map_err(|err| LoadError::permanent(err.to_string()))?
                    .slice_move(s![.., .., 0]);
                let values: Vec<$ty> = frame.iter().copied().collect();
                bytemuck::cast_slice::<$ty, u8>(&values).to_vec()
            }};
        }
        let bytes = match element_type {
            ElementType::Uint8 => frame_bytes!(u8),
            ElementType::Int8 => frame_bytes!(i8),
            ElementType::Uint16 => frame_bytes!(u16),
            ElementType::Int16 => frame_bytes!(i16),
            ElementType::Float32 => frame_bytes!(f32),
            ElementType::Float16 => {
                return Err(LoadError::permanent("16 bit float pixel data is not stored by DICOM"));
            }
        };

        Ok(RawFrame {
            rows: pixel_data.rows(),
            columns: pixel_data.columns(),
            element_type,
            bytes,
        })
    }
}

/// Stored pixel values of one decoded frame.
struct RawFrame {
    rows: u32,
    columns: u32,
    element_type: ElementType,
    bytes: Vec<u8>,
}

impl ImageLoader for DicomFileLoader {
    fn load(
        &self,
        image_id: &str,
        options: LoadOptions,
    ) -> BoxFuture<'static, Result<DecodedImage, LoadError>> {
        let path = self.root.join(image_id);
        let image_id = image_id.to_owned();

        async move {
            let frame = tokio::task::spawn_blocking(move || Self::decode_file(&path))
                .await
                .map_err(|err| LoadError::transient(err.to_string()))??;

            if options.cancel.is_cancelled() {
                return Err(LoadError::Cancelled);
            }

            let status = ImageQualityStatus::FullResolution;
            match options.target {
                Some(target) if target.accepts(frame.element_type, frame.bytes.len()) => {
                    let write = target
                        .write(status, |dst| {
                            dst.copy_from_slice(&frame.bytes);
                            Ok(())
                        })
                        .map_err(|err| LoadError::permanent(err.to_string()))?;
                    match write {
                        FrameWrite::Written => debug!(image_id = %image_id, "Decoded into target"),
                        FrameWrite::Rejected { current } => {
                            trace!(image_id = %image_id, %current, "Target already holds better data")
                        }
                    }
                    Ok(DecodedImage::in_target(
                        image_id,
                        frame.rows,
                        frame.columns,
                        frame.element_type,
                        status,
                        target,
                        write,
                    ))
                }
                _ => Ok(DecodedImage::owned(
                    image_id,
                    frame.rows,
                    frame.columns,
                    frame.element_type,
                    status,
                    frame.bytes,
                )),
            }
        }
        .boxed()
    }
}
