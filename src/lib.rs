//! # DICOM-stream library
//!
//! This crate serves a streaming volume cache and progressive image loading
//! pipeline for DICOM series

//!
//! Volumes are backed by an arena with one lock per frame, filled frame by frame
//! while the individual images arrive, in any order and at varying quality.
//! Every frame remembers the quality of the data it holds, so a late low
//! resolution preview can never overwrite a finished full resolution decode.
//! The library is split into:
//!  - Request pool: prioritized, deduplicated and cancellable dispatch of
//!    image loads to a pluggable [`ImageLoader`]
//!  - Cache: byte-budgeted LRU registry of images and volumes with pinning
//!  - Volume loader: creates volumes from metadata and streams frames into
//!    them, optionally interleaved for early coverage of the whole volume
//!
//!  Fetching and decoding is left to the [`ImageLoader`] implementation.
//!  [`DicomFileLoader`] reads DICOM files from disk using dicom-rs; network
//!  loaders are expected to be provided by library consumers.
//!  DICOM files are assumed to have the following attributes:
//!   - No multiframe (always the first frame is used)
//!   - Images of one volume share rows and columns
//!
//! # Examples
//!
//! ## Streaming a directory of DICOM files into a volume
//!
//! Register the metadata of each file, create a volume for them and load it
//! with every third frame first. Then save the frame at the center of the
//! volume.
//!
//! ```no_run
//! # use dicom_stream::{DicomFileLoader, DicomMetadataProvider, RequestPool, SortBy,
//! #     StreamingConfig, VolumeLoadOptions, VolumeLoader, ProgressiveOrder};
//! # use std::sync::Arc;
//! # async fn run() {
//! let mut metadata = DicomMetadataProvider::new();
//! for name in ["1.dcm", "2.dcm", "3.dcm"] {
//!     let object = dicom::object::open_file(format!("dicom/{name}"))
//!         .expect("should have opened DICOM file");
//!     metadata.insert(name, object);
//! }
//!
//! let config = StreamingConfig::default();
//! let pool = RequestPool::new(Arc::new(DicomFileLoader::new("dicom")), config.pool.clone());
//! let loader = VolumeLoader::new(pool, Arc::new(metadata), config);
//! let volume = loader
//!     .create_volume("series", vec!["1.dcm".into(), "2.dcm".into(), "3.dcm".into()], SortBy::default())
//!     .expect("should have created volume");
//!
//! let status = loader
//!     .load(&volume, VolumeLoadOptions::default().with_order(ProgressiveOrder::Interleaved { factor: 3 }))
//!     .wait()
//!     .await;
//! println!("{} of {} frames loaded", status.loaded, status.total);
//!
//! volume
//!     .frame_preview(volume.dim().0 / 2)
//!     .expect("should have returned frame at center of volume")
//!     .save("result.png")
//!     .expect("should have saved preview");
//! # }
//! ```

pub mod arena;
pub mod cache;
pub mod config;
mod convert;
pub mod enums;
pub mod loader;
pub mod metadata;
pub mod request_pool;
pub mod volume;
pub mod volume_loader;

/// Identifier of a single image, as understood by the [`ImageLoader`].
pub type ImageId = String;

pub use arena::{Arena, ArenaError};
pub use cache::{Cache, CacheEntry, CacheError, CachePayload, CacheStats, SharedCache};
pub use config::{RequestPoolConfig, StreamingConfig};
pub use enums::{
    AllocationStrategy, ElementType, FailurePolicy, ImageQualityStatus, LoadState,
    ProgressiveOrder, RequestType, SortBy,
};
pub use loader::{DecodedImage, DicomFileLoader, ImageLoader, LoadError, LoadOptions, PixelData};
pub use metadata::{DicomMetadataProvider, InMemoryMetadataProvider, Metadata, MetadataProvider};
pub use request_pool::{RequestHandle, RequestPool, RequestPoolStats, Subscription};
pub use volume::{FrameTarget, FrameWrite, LoadStatus, StreamingImageVolume, VolumeGeometry};
pub use volume_loader::{
    RetryPolicy, TargetOptions, VolumeLoad, VolumeLoadListener, VolumeLoadOptions, VolumeLoader,
    VolumeLoaderError,
};
