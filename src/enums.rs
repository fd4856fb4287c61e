use std::fmt;

/// Quality of the pixel data currently held for a frame.
///
/// Variants are ordered from least to most complete. A frame slot only ever
/// moves up this order: data arriving with a lower or equal status than what
/// is already stored is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ImageQualityStatus {
    /// Copied from a frame further than one slice away.
    FarReplicate = 1,
    /// Copied from the directly neighbouring slice.
    AdjacentReplicate = 3,
    /// Decoded at reduced resolution.
    Subresolution = 6,
    /// Full resolution, lossy encoded.
    Lossy = 7,
    /// Full resolution, lossless.
    FullResolution = 8,
}

impl ImageQualityStatus {
    /// Returns the status to store when `new` arrives for a slot currently at
    /// `current`, or `None` when the arrival must be discarded.
    ///
    /// ```
    /// use dicom_stream::enums::ImageQualityStatus::*;
    /// use dicom_stream::enums::ImageQualityStatus;
    ///
    /// assert_eq!(ImageQualityStatus::upgrade(None, Lossy), Some(Lossy));
    /// assert_eq!(ImageQualityStatus::upgrade(Some(FullResolution), Lossy), None);
    /// assert_eq!(ImageQualityStatus::upgrade(Some(Lossy), Lossy), None);
    /// ```
    pub fn upgrade(current: Option<Self>, new: Self) -> Option<Self> {
        match current {
            Some(current) if new <= current => None,
            _ => Some(new),
        }
    }

    /// Replicated statuses hold borrowed data from another slice.
    pub fn is_replicate(self) -> bool {
        matches!(self, Self::FarReplicate | Self::AdjacentReplicate)
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Inverse of [`to_u8`](Self::to_u8). `0` and unknown values map to `None`.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::FarReplicate),
            3 => Some(Self::AdjacentReplicate),
            6 => Some(Self::Subresolution),
            7 => Some(Self::Lossy),
            8 => Some(Self::FullResolution),
            _ => None,
        }
    }
}

impl fmt::Display for ImageQualityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FarReplicate => "far-replicate",
            Self::AdjacentReplicate => "adjacent-replicate",
            Self::Subresolution => "subresolution",
            Self::Lossy => "lossy",
            Self::FullResolution => "full-resolution",
        };
        f.write_str(name)
    }
}

/// Why a frame or image is being requested. Each type has its own
/// concurrency limit in the request pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RequestType {
    /// The user is looking at it right now.
    #[default]
    Interaction,
    Thumbnail,
    /// Background fill of data that may be needed later.
    Prefetch,
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interaction => f.write_str("interaction"),
            Self::Thumbnail => f.write_str("thumbnail"),
            Self::Prefetch => f.write_str("prefetch"),
        }
    }
}

/// Voxel type stored in an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ElementType {
    Uint8,
    Int8,
    #[default]
    Uint16,
    Int16,
    Float16,
    Float32,
}

impl ElementType {
    pub fn byte_size(self) -> usize {
        match self {
            Self::Uint8 | Self::Int8 => 1,
            Self::Uint16 | Self::Int16 | Self::Float16 => 2,
            Self::Float32 => 4,
        }
    }

    /// Element type for stored pixels given DICOM bits allocated and pixel
    /// representation (0 unsigned, 1 signed).
    pub fn from_pixel_format(bits_allocated: u16, pixel_representation: u16) -> Option<Self> {
        match (bits_allocated, pixel_representation) {
            (8, 0) => Some(Self::Uint8),
            (8, _) => Some(Self::Int8),
            (16, 0) => Some(Self::Uint16),
            (16, _) => Some(Self::Int16),
            (32, _) => Some(Self::Float32),
            _ => None,
        }
    }
}

/// How an arena's backing memory is provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationStrategy {
    /// Per-frame locking, decoders may write straight into the arena.
    #[default]
    Shared,
    /// One lock for the whole buffer; decoded frames are copied in by the
    /// volume loader.
    Private,
}

/// Lifecycle of a streaming volume load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    NotStarted,
    Loading,
    Done,
    Failed,
    Cancelled,
}

impl LoadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// Order in which the frames of a volume are requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressiveOrder {
    #[default]
    Sequential,
    /// Every `factor`-th frame first, then the gaps stage by stage, so early
    /// data covers the whole volume.
    Interleaved { factor: usize },
}

impl ProgressiveOrder {
    /// Splits `indices` into stages. Sequential order is a single stage.
    pub fn stages(self, indices: &[usize]) -> Vec<Vec<usize>> {
        match self {
            Self::Sequential => vec![indices.to_vec()],
            Self::Interleaved { factor } => {
                let factor = factor.max(1);
                (0..factor)
                    .map(|stage| {
                        indices
                            .iter()
                            .copied()
                            .filter(|index| index % factor == stage)
                            .collect::<Vec<_>>()
                    })
                    .filter(|stage| !stage.is_empty())
                    .collect()
            }
        }
    }
}

/// Order of the image ids when a volume is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortBy {
    /// Descending z of the image position, images without one last.
    #[default]
    ImagePositionPatient,
    /// Keep the order given by the caller.
    None,
}

/// What a permanent per-frame failure means for the whole volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// The frame stays empty and the rest of the volume keeps loading.
    #[default]
    Gap,
    /// Any permanent frame failure marks the volume load as failed.
    FailVolume,
}
