use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use web_time::Instant;

use crate::ImageId;
use crate::arena::{Arena, ArenaError};
use crate::cache::{CacheEntry, CacheError, SharedCache};
use crate::config::StreamingConfig;
use crate::convert;
use crate::enums::{
    ElementType, FailurePolicy, ImageQualityStatus, LoadState, ProgressiveOrder, RequestType,
    SortBy,
};
use crate::loader::{DecodedImage, LoadError, PixelData};
use crate::metadata::{MetadataModule, MetadataProvider};
use crate::request_pool::{RequestHandle, RequestPool};
use crate::volume::{FrameTarget, FrameWrite, LoadStatus, StreamingImageVolume, VolumeGeometry};

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No image ids given")]
    NoImages,

    #[error("Missing {module:?} metadata for {image_id}")]
    MissingMetadata {
        image_id: ImageId,
        module: MetadataModule,
    },

    #[error("Inconsistent image geometry: {image_id}")]
    InconsistentGeometry { image_id: ImageId },

    #[error("Unsupported pixel format: {bits_allocated} bits allocated")]
    UnsupportedPixelFormat { bits_allocated: u16 },

    #[error("Unsupported samples per pixel: {samples_per_pixel}")]
    UnsupportedSamplesPerPixel { samples_per_pixel: u16 },

    #[error("Arena error: {0}")]
    Arena(#[from] ArenaError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Load error: {0}")]
    Load(#[from] LoadError),
}

/// Retry of transient frame failures with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (starting at 0).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1 << attempt.min(16))
    }
}

/// Per-frame overrides returned by [`VolumeLoadListener::target_options`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetOptions {
    pub priority: Option<i32>,
    pub request_type: Option<RequestType>,
}

/// Progress callbacks of a volume load. Called from the task driving the load.
pub trait VolumeLoadListener: Send + Sync {
    /// Frame `image_index` now holds data of `status`.
    fn on_frame_loaded(
        &self,
        _image_id: &str,
        _image_index: usize,
        _image: &DecodedImage,
        _status: ImageQualityStatus,
    ) {
    }

    /// Frame failed for good (`permanent`) or after its retries ran out.
    fn on_frame_error(&self, _image_id: &str, _permanent: bool, _reason: &str) {}

    fn target_options(&self, _image_id: &str) -> Option<TargetOptions> {
        None
    }

    fn on_load_complete(&self, _status: &LoadStatus) {}
}

#[derive(Clone)]
pub struct VolumeLoadOptions {
    pub request_type: RequestType,
    pub priority: i32,
    pub order: ProgressiveOrder,
    /// Frames to load, all of them when `None`.
    pub frames: Option<Vec<usize>>,
    /// Frames already at this status or better are skipped.
    pub target_status: ImageQualityStatus,
    /// Copy each interleave anchor into its unloaded neighbours as a preview.
    pub replicate: bool,
    pub retry: RetryPolicy,
    pub failure_policy: FailurePolicy,
    pub listeners: Vec<Arc<dyn VolumeLoadListener>>,
}

impl Default for VolumeLoadOptions {
    fn default() -> Self {
        Self {
            request_type: RequestType::Interaction,
            priority: 0,
            order: ProgressiveOrder::Sequential,
            frames: None,
            target_status: ImageQualityStatus::FullResolution,
            replicate: false,
            retry: RetryPolicy::default(),
            failure_policy: FailurePolicy::Gap,
            listeners: Vec::new(),
        }
    }
}

impl VolumeLoadOptions {
    pub fn with_request_type(mut self, request_type: RequestType) -> Self {
        self.request_type = request_type;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_order(mut self, order: ProgressiveOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_frames(mut self, frames: Vec<usize>) -> Self {
        self.frames = Some(frames);
        self
    }

    pub fn with_target_status(mut self, status: ImageQualityStatus) -> Self {
        self.target_status = status;
        self
    }

    pub fn with_replicate(mut self, replicate: bool) -> Self {
        self.replicate = replicate;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn VolumeLoadListener>) -> Self {
        self.listeners.push(listener);
        self
    }
}

/// A running volume load.
pub struct VolumeLoad {
    volume: Arc<StreamingImageVolume>,
    cancel: CancellationToken,
    done: watch::Receiver<Option<LoadStatus>>,
}

impl VolumeLoad {
    /// Stop requesting frames. Frames already written keep their data.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn status(&self) -> LoadStatus {
        self.volume.load_status()
    }

    pub fn volume(&self) -> &Arc<StreamingImageVolume> {
        &self.volume
    }

    pub fn is_finished(&self) -> bool {
        self.done.borrow().is_some()
    }

    /// Wait until every frame request has resolved or the load was cancelled.
    pub async fn wait(&self) -> LoadStatus {
        let mut done = self.done.clone();
        let finished = match done.wait_for(Option::is_some).await {
            Ok(status) => *status,
            Err(_) => None,
        };
        finished.unwrap_or_else(|| self.volume.load_status())
    }
}

struct FrameOutcome {
    index: usize,
    image_id: ImageId,
    result: Result<Arc<DecodedImage>, LoadError>,
}

/// Everything a frame request needs to be re-issued.
#[derive(Clone)]
struct FrameRequest {
    index: usize,
    image_id: ImageId,
    request_type: RequestType,
    priority: i32,
    target: Option<FrameTarget>,
}

/// Creates streaming volumes and fills them through a [`RequestPool`].
#[derive(Clone)]
pub struct VolumeLoader {
    pool: RequestPool,
    metadata: Arc<dyn MetadataProvider>,
    config: StreamingConfig,
}

impl VolumeLoader {
    pub fn new(
        pool: RequestPool,
        metadata: Arc<dyn MetadataProvider>,
        config: StreamingConfig,
    ) -> Self {
        Self {
            pool,
            metadata,
            config,
        }
    }

    pub fn pool(&self) -> &RequestPool {
        &self.pool
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Create an empty volume for `image_ids`, sized from their metadata.
    ///
    /// # Errors
    ///
    /// Returns error if no ids are given, metadata is missing, or the images
    /// disagree on rows and columns
    pub fn create_volume(
        &self,
        volume_id: impl Into<String>,
        mut image_ids: Vec<ImageId>,
        sort_by: SortBy,
    ) -> Result<Arc<StreamingImageVolume>, VolumeLoaderError> {
        if image_ids.is_empty() {
            return Err(VolumeLoaderError::NoImages);
        }
        self.sort_images(&mut image_ids, sort_by);
        let geometry = self.build_geometry(&image_ids)?;

        let arena = Arena::allocate_with_fallback(
            image_ids.len(),
            geometry.frame_byte_length(),
            geometry.element_type,
            self.config.allocation,
            self.config.shared_memory_limit,
        )?;
        let volume = StreamingImageVolume::new(
            volume_id,
            image_ids,
            geometry,
            arena,
            self.config.loaded_threshold,
        )?;
        info!(
            volume_id = volume.volume_id(),
            dim = ?volume.dim(),
            element_type = ?geometry.element_type,
            bytes = volume.size_in_bytes(),
            "Created streaming volume"
        );
        Ok(Arc::new(volume))
    }

    /// Return the cached volume `volume_id`, or create and cache it.
    pub fn create_and_cache_volume(
        &self,
        cache: &SharedCache,
        volume_id: impl Into<String>,
        image_ids: Vec<ImageId>,
        sort_by: SortBy,
    ) -> Result<Arc<StreamingImageVolume>, VolumeLoaderError> {
        let volume_id = volume_id.into();
        let cached = cache.lock().get_volume(&volume_id);
        if let Some(volume) = cached {
            return Ok(volume);
        }
        let volume = self.create_volume(volume_id, image_ids, sort_by)?;
        cache.lock().put(CacheEntry::volume(volume.clone()))?;
        Ok(volume)
    }

    fn sort_images(&self, image_ids: &mut [ImageId], sort_by: SortBy) {
        if sort_by == SortBy::None {
            return;
        }
        let mut with_order: Vec<(Option<f32>, ImageId)> = image_ids
            .iter()
            .map(|id| {
                let z = self
                    .metadata
                    .image_plane(id)
                    .and_then(|plane| plane.image_position)
                    .map(|position| position[2]);
                (z, id.clone())
            })
            .collect();
        with_order.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        with_order.reverse();
        for (slot, (_, id)) in image_ids.iter_mut().zip(with_order) {
            *slot = id;
        }
    }

    fn build_geometry(&self, image_ids: &[ImageId]) -> Result<VolumeGeometry, VolumeLoaderError> {
        let first = &image_ids[0];
        let pixel = self.metadata.image_pixel(first).ok_or_else(|| {
            VolumeLoaderError::MissingMetadata {
                image_id: first.clone(),
                module: MetadataModule::ImagePixel,
            }
        })?;
        if pixel.samples_per_pixel != 1 {
            return Err(VolumeLoaderError::UnsupportedSamplesPerPixel {
                samples_per_pixel: pixel.samples_per_pixel,
            });
        }
        self.validate_dimensions(image_ids, pixel.rows, pixel.columns)?;

        let spacing = self.get_spacing(image_ids).ok_or_else(|| {
            VolumeLoaderError::MissingMetadata {
                image_id: first.clone(),
                module: MetadataModule::ImagePlane,
            }
        })?;
        let scaling = self
            .metadata
            .modality_lut(first)
            .filter(|lut| !lut.is_identity());
        let element_type = match scaling {
            Some(_) => ElementType::Float32,
            None => ElementType::from_pixel_format(pixel.bits_allocated, pixel.pixel_representation)
                .ok_or(VolumeLoaderError::UnsupportedPixelFormat {
                    bits_allocated: pixel.bits_allocated,
                })?,
        };

        Ok(VolumeGeometry {
            rows: pixel.rows,
            columns: pixel.columns,
            samples_per_pixel: pixel.samples_per_pixel,
            spacing,
            element_type,
            scaling,
        })
    }

    fn validate_dimensions(
        &self,
        image_ids: &[ImageId],
        rows: u32,
        columns: u32,
    ) -> Result<(), VolumeLoaderError> {
        for image_id in image_ids {
            let pixel = self.metadata.image_pixel(image_id).ok_or_else(|| {
                VolumeLoaderError::MissingMetadata {
                    image_id: image_id.clone(),
                    module: MetadataModule::ImagePixel,
                }
            })?;
            if (pixel.rows, pixel.columns) != (rows, columns) {
                return Err(VolumeLoaderError::InconsistentGeometry {
                    image_id: image_id.clone(),
                });
            }
        }
        Ok(())
    }

    fn get_spacing(&self, image_ids: &[ImageId]) -> Option<(f32, f32, f32)> {
        image_ids.iter().find_map(|image_id| {
            let plane = self.metadata.image_plane(image_id)?;
            Some((
                plane.pixel_spacing.0,
                plane.pixel_spacing.1,
                plane.slice_thickness,
            ))
        })
    }

    /// Start filling `volume`. Frame requests are issued before this returns;
    /// their results are applied by a spawned task.
    ///
    /// An interleaved order with a factor of 0 uses the configured
    /// interleave factor.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn load(&self, volume: &Arc<StreamingImageVolume>, mut options: VolumeLoadOptions) -> VolumeLoad {
        if let ProgressiveOrder::Interleaved { factor: 0 } = options.order {
            options.order = ProgressiveOrder::Interleaved {
                factor: self.config.interleave_factor,
            };
        }
        let cancel = CancellationToken::new();
        let load_id = volume.begin_load(cancel.clone());
        let (done_tx, done) = watch::channel(None);

        let indices: Vec<usize> = match &options.frames {
            Some(frames) => frames
                .iter()
                .copied()
                .filter(|&index| index < volume.frame_count())
                .collect(),
            None => (0..volume.frame_count()).collect(),
        };
        let indices: Vec<usize> = indices
            .into_iter()
            .filter(|&index| {
                volume
                    .frame_status(index)
                    .is_none_or(|status| status < options.target_status)
            })
            .collect();

        let stages = options.order.stages(&indices);
        let anchors: HashSet<usize> = match options.order {
            ProgressiveOrder::Interleaved { factor } if options.replicate && factor > 1 => {
                stages.first().cloned().unwrap_or_default().into_iter().collect()
            }
            _ => HashSet::new(),
        };

        debug!(
            volume_id = volume.volume_id(),
            frames = indices.len(),
            stages = stages.len(),
            priority = options.priority,
            "Starting volume load"
        );

        let pending: FuturesUnordered<BoxFuture<'static, FrameOutcome>> = FuturesUnordered::new();
        for (stage, frames) in stages.iter().enumerate() {
            for &index in frames {
                let request = self.frame_request(volume, index, stage, &options);
                if let Ok(slot) = volume.frame(index) {
                    slot.set_loading(true);
                }
                let handle = self.pool.request(
                    request.image_id.clone(),
                    request.request_type,
                    request.priority,
                    request.target.clone(),
                );
                pending.push(self.await_frame(request, handle, options.retry, cancel.clone()));
            }
        }

        let driver = LoadDriver {
            volume: volume.clone(),
            load_id,
            cancel: cancel.clone(),
            anchors,
            options,
            started: Instant::now(),
        };
        tokio::spawn(async move {
            let status = driver.run(pending).await;
            let _ = done_tx.send(Some(status));
        });

        VolumeLoad {
            volume: volume.clone(),
            cancel,
            done,
        }
    }

    fn frame_request(
        &self,
        volume: &Arc<StreamingImageVolume>,
        index: usize,
        stage: usize,
        options: &VolumeLoadOptions,
    ) -> FrameRequest {
        let image_id = volume.image_ids()[index].clone();
        let overrides = options
            .listeners
            .iter()
            .find_map(|listener| listener.target_options(&image_id))
            .unwrap_or_default();
        let target = if volume.arena().supports_direct_write() {
            FrameTarget::new(volume.clone(), index).ok()
        } else {
            None
        };
        FrameRequest {
            index,
            request_type: overrides.request_type.unwrap_or(options.request_type),
            priority: overrides
                .priority
                .unwrap_or(options.priority.saturating_sub(stage as i32)),
            target,
            image_id,
        }
    }

    /// Wait for one frame, re-requesting transient failures per `retry`.
    fn await_frame(
        &self,
        request: FrameRequest,
        first: RequestHandle,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, FrameOutcome> {
        let pool = self.pool.clone();
        async move {
            let mut handle = first;
            let mut attempt = 0;
            loop {
                let subscription = handle.subscription();
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        subscription.cancel();
                        Err(LoadError::Cancelled)
                    }
                    result = handle.wait() => result,
                };

                match result {
                    Err(LoadError::Transient { reason }) if attempt < retry.max_retries => {
                        let delay = retry.delay(attempt);
                        attempt += 1;
                        debug!(
                            image_id = %request.image_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            reason = %reason,
                            "Retrying frame"
                        );
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                return FrameOutcome {
                                    index: request.index,
                                    image_id: request.image_id,
                                    result: Err(LoadError::Cancelled),
                                };
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        handle = pool.request(
                            request.image_id.clone(),
                            request.request_type,
                            request.priority,
                            request.target.clone(),
                        );
                    }
                    result => {
                        return FrameOutcome {
                            index: request.index,
                            image_id: request.image_id,
                            result,
                        };
                    }
                }
            }
        }
        .boxed()
    }

    /// Return `image_id` from `cache`, or load it through the pool and cache it.
    pub async fn load_and_cache_image(
        &self,
        cache: &SharedCache,
        image_id: &str,
        request_type: RequestType,
        priority: i32,
    ) -> Result<Arc<DecodedImage>, VolumeLoaderError> {
        let cached = cache.lock().get_image(image_id);
        if let Some(image) = cached {
            trace!(image_id, "Image cache hit");
            return Ok(image);
        }
        let loaded = self
            .pool
            .request(image_id, request_type, priority, None)
            .wait()
            .await?;
        // A load shared with a volume frame left its pixels in that volume.
        let image = if matches!(loaded.pixels, PixelData::InTarget { .. }) {
            Arc::new(loaded.to_owned_pixels()?)
        } else {
            loaded
        };
        cache.lock().put(CacheEntry::image(image.clone()))?;
        Ok(image)
    }
}

/// Applies frame results to a volume as they arrive.
struct LoadDriver {
    volume: Arc<StreamingImageVolume>,
    load_id: u64,
    cancel: CancellationToken,
    /// Frames whose data is replicated into their neighbours.
    anchors: HashSet<usize>,
    options: VolumeLoadOptions,
    started: Instant,
}

impl LoadDriver {
    async fn run(self, mut pending: FuturesUnordered<BoxFuture<'static, FrameOutcome>>) -> LoadStatus {
        let mut fatal = false;

        while let Some(outcome) = pending.next().await {
            if let Ok(slot) = self.volume.frame(outcome.index) {
                slot.set_loading(false);
            }
            match &outcome.result {
                Ok(image) => {
                    if let Err(err) = self.apply(outcome.index, &outcome.image_id, &image) {
                        warn!(
                            image_id = %outcome.image_id,
                            error = %err,
                            "Could not store frame"
                        );
                        fatal |= self.frame_failed(&outcome, true, &err.to_string());
                    }
                }
                Err(LoadError::Cancelled) => {}
                Err(err) => {
                    fatal |= self.frame_failed(&outcome, err.is_permanent(), err.reason());
                }
            }
        }

        let state = if fatal {
            LoadState::Failed
        } else if self.cancel.is_cancelled() {
            LoadState::Cancelled
        } else {
            LoadState::Done
        };
        self.volume.finish_load(self.load_id, state);
        let status = self.volume.load_status();
        info!(
            volume_id = self.volume.volume_id(),
            ?state,
            loaded = status.loaded,
            failed = status.failed,
            total = status.total,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Volume load finished"
        );
        for listener in &self.options.listeners {
            listener.on_load_complete(&status);
        }
        status
    }

    /// Report a failed frame. Returns whether the whole load now fails.
    fn frame_failed(&self, outcome: &FrameOutcome, permanent: bool, reason: &str) -> bool {
        if let Ok(slot) = self.volume.frame(outcome.index) {
            slot.set_failed(true);
        }
        for listener in &self.options.listeners {
            listener.on_frame_error(&outcome.image_id, permanent, reason);
        }
        if permanent && self.options.failure_policy == FailurePolicy::FailVolume {
            warn!(
                volume_id = self.volume.volume_id(),
                image_id = %outcome.image_id,
                "Permanent frame failure, failing volume load"
            );
            self.cancel.cancel();
            return true;
        }
        false
    }

    fn apply(&self, index: usize, image_id: &str, image: &DecodedImage) -> Result<(), ArenaError> {
        match self.commit(index, image)? {
            FrameWrite::Written => {
                trace!(image_id, index, status = %image.status, "Frame written");
                for listener in &self.options.listeners {
                    listener.on_frame_loaded(image_id, index, image, image.status);
                }
                if self.anchors.contains(&index) && !image.status.is_replicate() {
                    self.replicate(index)?;
                }
            }
            FrameWrite::Rejected { current } => {
                trace!(image_id, index, %current, "Frame already holds better data");
            }
        }
        Ok(())
    }

    fn commit(&self, index: usize, image: &DecodedImage) -> Result<FrameWrite, ArenaError> {
        // The loader already went through this frame's quality gate.
        if let PixelData::InTarget { target, write } = &image.pixels {
            if target.is_frame_of(&self.volume, index) {
                return Ok(*write);
            }
        }

        let bytes = image.bytes()?;
        let scaling = if image.scaled {
            None
        } else {
            self.volume.geometry().scaling
        };
        let element_type = self.volume.element_type();
        self.volume.commit_frame_with(index, image.status, |frame| {
            convert::write_converted(&bytes, image.element_type, scaling, frame, element_type)
        })
    }

    /// Copy anchor frame `index` into the following frames up to the next
    /// anchor. Failed frames stay untouched.
    fn replicate(&self, index: usize) -> Result<(), ArenaError> {
        let ProgressiveOrder::Interleaved { factor } = self.options.order else {
            return Ok(());
        };
        let bytes = self.volume.arena().read_frame(index)?;
        let end = (index + factor).min(self.volume.frame_count());
        for neighbour in index + 1..end {
            if self.volume.frame(neighbour)?.is_failed() {
                continue;
            }
            let status = if neighbour == index + 1 {
                ImageQualityStatus::AdjacentReplicate
            } else {
                ImageQualityStatus::FarReplicate
            };
            self.volume.commit_frame(neighbour, status, &bytes)?;
        }
        trace!(
            volume_id = self.volume.volume_id(),
            index,
            filled = end.saturating_sub(index + 1),
            "Replicated anchor frame"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RequestPoolConfig;
    use crate::enums::AllocationStrategy;
    use crate::loader::{ImageLoader, LoadOptions};
    use crate::metadata::{
        ImagePixelModule, ImagePlaneModule, InMemoryMetadataProvider, Metadata, ModalityLutModule,
    };
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Loader answering immediately from a script keyed by image id. Ids
    /// without a script get a frame filled with their index byte.
    #[derive(Default)]
    struct ScriptedLoader {
        failures: Mutex<HashMap<String, Vec<LoadError>>>,
        calls: Mutex<Vec<String>>,
        pixel_len: usize,
    }

    impl ScriptedLoader {
        fn new(pixel_len: usize) -> Self {
            Self {
                pixel_len,
                ..Self::default()
            }
        }

        fn fail(&self, id: &str, errors: Vec<LoadError>) {
            self.failures.lock().insert(id.to_owned(), errors);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl ImageLoader for ScriptedLoader {
        fn load(
            &self,
            image_id: &str,
            _options: LoadOptions,
        ) -> BoxFuture<'static, Result<DecodedImage, LoadError>> {
            self.calls.lock().push(image_id.to_owned());
            let scripted = self
                .failures
                .lock()
                .get_mut(image_id)
                .and_then(|errors| (!errors.is_empty()).then(|| errors.remove(0)));
            let fill = image_id.trim_start_matches('f').parse::<u8>().unwrap_or(0xEE) + 1;
            let image = DecodedImage::owned(
                image_id,
                1,
                self.pixel_len as u32,
                ElementType::Uint8,
                ImageQualityStatus::FullResolution,
                vec![fill; self.pixel_len],
            );
            async move {
                match scripted {
                    Some(err) => Err(err),
                    None => Ok(image),
                }
            }
            .boxed()
        }
    }

    fn metadata(ids: &[&str], rows: u32, columns: u32) -> InMemoryMetadataProvider {
        let provider = InMemoryMetadataProvider::new();
        for (z, id) in ids.iter().enumerate() {
            provider.insert(
                *id,
                Metadata::ImagePixel(ImagePixelModule {
                    rows,
                    columns,
                    bits_allocated: 8,
                    pixel_representation: 0,
                    samples_per_pixel: 1,
                }),
            );
            provider.insert(
                *id,
                Metadata::ImagePlane(ImagePlaneModule {
                    pixel_spacing: (0.5, 0.5),
                    slice_thickness: 2.0,
                    image_position: Some([0.0, 0.0, z as f32]),
                }),
            );
        }
        provider
    }

    fn ids(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("f{i}")).collect()
    }

    fn setup(
        count: usize,
        loader: Arc<ScriptedLoader>,
        pool_config: RequestPoolConfig,
    ) -> (VolumeLoader, Arc<StreamingImageVolume>) {
        setup_with_config(count, loader, StreamingConfig::default().with_pool(pool_config))
    }

    fn setup_with_config(
        count: usize,
        loader: Arc<ScriptedLoader>,
        config: StreamingConfig,
    ) -> (VolumeLoader, Arc<StreamingImageVolume>) {
        let image_ids = ids(count);
        let id_refs: Vec<&str> = image_ids.iter().map(String::as_str).collect();
        let provider = Arc::new(metadata(&id_refs, 2, 2));
        let pool = RequestPool::new(loader, config.pool.clone());
        let volume_loader = VolumeLoader::new(pool, provider, config);
        let volume = volume_loader
            .create_volume("vol", image_ids, SortBy::None)
            .unwrap();
        (volume_loader, volume)
    }

    #[derive(Default)]
    struct Recorder {
        loaded: Mutex<Vec<(String, usize, ImageQualityStatus)>>,
        errors: Mutex<Vec<(String, bool, String)>>,
        completed: Mutex<Vec<LoadStatus>>,
    }

    impl VolumeLoadListener for Recorder {
        fn on_frame_loaded(
            &self,
            image_id: &str,
            image_index: usize,
            _image: &DecodedImage,
            status: ImageQualityStatus,
        ) {
            self.loaded
                .lock()
                .push((image_id.to_owned(), image_index, status));
        }

        fn on_frame_error(&self, image_id: &str, permanent: bool, reason: &str) {
            self.errors
                .lock()
                .push((image_id.to_owned(), permanent, reason.to_owned()));
        }

        fn on_load_complete(&self, status: &LoadStatus) {
            self.completed.lock().push(*status);
        }
    }

    #[test]
    fn test_create_volume_geometry() {
        let (_, volume) = setup(3, Arc::new(ScriptedLoader::new(4)), RequestPoolConfig::default());
        assert_eq!(volume.dim(), (3, 2, 2));
        assert_eq!(volume.element_type(), ElementType::Uint8);
        assert_eq!(volume.geometry().spacing, (0.5, 0.5, 2.0));
        assert_eq!(volume.size_in_bytes(), 12);
    }

    #[test]
    fn test_create_volume_errors() {
        let provider = Arc::new(metadata(&["a"], 2, 2));
        provider.insert(
            "b",
            Metadata::ImagePixel(ImagePixelModule {
                rows: 3,
                columns: 2,
                bits_allocated: 8,
                pixel_representation: 0,
                samples_per_pixel: 1,
            }),
        );
        let pool = RequestPool::new(
            Arc::new(ScriptedLoader::new(4)),
            RequestPoolConfig::default(),
        );
        let loader = VolumeLoader::new(pool, provider, StreamingConfig::default());

        assert!(matches!(
            loader.create_volume("v", vec![], SortBy::None),
            Err(VolumeLoaderError::NoImages)
        ));
        assert!(matches!(
            loader.create_volume("v", vec!["a".into(), "b".into()], SortBy::None),
            Err(VolumeLoaderError::InconsistentGeometry { image_id }) if image_id == "b"
        ));
        assert!(matches!(
            loader.create_volume("v", vec!["a".into(), "c".into()], SortBy::None),
            Err(VolumeLoaderError::MissingMetadata { module: MetadataModule::ImagePixel, .. })
        ));
    }

    #[test]
    fn test_scaled_volume_is_float32() {
        let provider = Arc::new(metadata(&["a"], 2, 2));
        provider.insert(
            "a",
            Metadata::ModalityLut(ModalityLutModule {
                rescale_slope: 2.0,
                rescale_intercept: -10.0,
            }),
        );
        let pool = RequestPool::new(
            Arc::new(ScriptedLoader::new(4)),
            RequestPoolConfig::default(),
        );
        let loader = VolumeLoader::new(pool, provider, StreamingConfig::default());
        let volume = loader.create_volume("v", vec!["a".into()], SortBy::None).unwrap();
        assert_eq!(volume.element_type(), ElementType::Float32);
        assert_eq!(volume.size_in_bytes(), 16);
    }

    #[test]
    fn test_multi_sample_images_are_rejected() {
        let provider = Arc::new(InMemoryMetadataProvider::new());
        provider.insert(
            "rgb",
            Metadata::ImagePixel(ImagePixelModule {
                rows: 2,
                columns: 2,
                bits_allocated: 8,
                pixel_representation: 0,
                samples_per_pixel: 3,
            }),
        );
        let pool = RequestPool::new(
            Arc::new(ScriptedLoader::new(4)),
            RequestPoolConfig::default(),
        );
        let loader = VolumeLoader::new(pool, provider, StreamingConfig::default());
        assert!(matches!(
            loader.create_volume("v", vec!["rgb".into()], SortBy::None),
            Err(VolumeLoaderError::UnsupportedSamplesPerPixel { samples_per_pixel: 3 })
        ));
    }

    #[test]
    fn test_sort_by_image_position() {
        let provider = Arc::new(metadata(&["f0", "f1", "f2"], 2, 2));
        let pool = RequestPool::new(
            Arc::new(ScriptedLoader::new(4)),
            RequestPoolConfig::default(),
        );
        let loader = VolumeLoader::new(pool, provider, StreamingConfig::default());
        let volume = loader
            .create_volume("v", vec!["f1".into(), "f0".into(), "f2".into()], SortBy::ImagePositionPatient)
            .unwrap();
        assert_eq!(volume.image_ids(), ["f2", "f1", "f0"]);
    }

    #[test]
    fn test_private_arena_fallback() {
        let provider = Arc::new(metadata(&["a"], 2, 2));
        let pool = RequestPool::new(
            Arc::new(ScriptedLoader::new(4)),
            RequestPoolConfig::default(),
        );
        let config = StreamingConfig::default().with_shared_memory_limit(1);
        let loader = VolumeLoader::new(pool, provider, config);
        let volume = loader.create_volume("v", vec!["a".into()], SortBy::None).unwrap();
        assert_eq!(volume.arena().strategy(), AllocationStrategy::Private);
    }

    #[tokio::test]
    async fn test_load_fills_every_frame() {
        let loader = Arc::new(ScriptedLoader::new(4));
        let (volume_loader, volume) = setup(3, loader.clone(), RequestPoolConfig::default());
        let recorder = Arc::new(Recorder::default());

        let load = volume_loader.load(
            &volume,
            VolumeLoadOptions::default().with_listener(recorder.clone()),
        );
        let status = load.wait().await;

        assert!(status.done());
        assert_eq!(status.loaded, 3);
        assert!(load.is_finished());
        assert_eq!(recorder.loaded.lock().len(), 3);
        assert_eq!(recorder.completed.lock().len(), 1);
        assert_eq!(volume.arena().read_frame(2).unwrap(), vec![3; 4]);
    }

    #[tokio::test]
    async fn test_interleaved_priorities() {
        let loader = Arc::new(ScriptedLoader::new(4));
        let config = RequestPoolConfig::default().with_max_concurrent(RequestType::Interaction, 1);
        let (volume_loader, volume) = setup(6, loader.clone(), config);

        let load = volume_loader.load(
            &volume,
            VolumeLoadOptions::default()
                .with_priority(10)
                .with_order(ProgressiveOrder::Interleaved { factor: 3 }),
        );
        load.wait().await;

        // f0 is dispatched on submission; the rest follow by stage.
        assert_eq!(loader.calls(), ["f0", "f3", "f1", "f4", "f2", "f5"]);
    }

    #[tokio::test]
    async fn test_interleave_factor_from_config() {
        let loader = Arc::new(ScriptedLoader::new(4));
        let config = StreamingConfig::default()
            .with_interleave_factor(3)
            .with_pool(RequestPoolConfig::default().with_max_concurrent(RequestType::Interaction, 1));
        let (volume_loader, volume) = setup_with_config(6, loader.clone(), config);

        volume_loader
            .load(
                &volume,
                VolumeLoadOptions::default()
                    .with_priority(10)
                    .with_order(ProgressiveOrder::Interleaved { factor: 0 }),
            )
            .wait()
            .await;

        assert_eq!(loader.calls(), ["f0", "f3", "f1", "f4", "f2", "f5"]);
    }

    #[tokio::test]
    async fn test_replicate_fills_neighbours_without_overwriting() {
        let loader = Arc::new(ScriptedLoader::new(4));
        let (volume_loader, volume) = setup(4, loader.clone(), RequestPoolConfig::default());
        volume
            .commit_frame(1, ImageQualityStatus::FullResolution, &[9; 4])
            .unwrap();

        let load = volume_loader.load(
            &volume,
            VolumeLoadOptions::default()
                .with_frames(vec![0])
                .with_order(ProgressiveOrder::Interleaved { factor: 4 })
                .with_replicate(true),
        );
        load.wait().await;

        assert_eq!(volume.frame_status(0), Some(ImageQualityStatus::FullResolution));
        assert_eq!(volume.arena().read_frame(1).unwrap(), vec![9; 4]);
        assert_eq!(volume.frame_status(2), Some(ImageQualityStatus::FarReplicate));
        assert_eq!(volume.arena().read_frame(3).unwrap(), vec![1; 4]);
        assert_eq!(volume.load_status().loaded, 2);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let loader = Arc::new(ScriptedLoader::new(4));
        loader.fail("f0", vec![LoadError::transient("timeout")]);
        let (volume_loader, volume) = setup(1, loader.clone(), RequestPoolConfig::default());
        let recorder = Arc::new(Recorder::default());

        let status = volume_loader
            .load(
                &volume,
                VolumeLoadOptions::default()
                    .with_retry(RetryPolicy::new(2, Duration::from_millis(1)))
                    .with_listener(recorder.clone()),
            )
            .wait()
            .await;

        assert_eq!(status.loaded, 1);
        assert_eq!(loader.calls(), ["f0", "f0"]);
        assert!(recorder.errors.lock().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_without_retry_is_reported() {
        let loader = Arc::new(ScriptedLoader::new(4));
        loader.fail("f1", vec![LoadError::transient("timeout")]);
        let (volume_loader, volume) = setup(2, loader.clone(), RequestPoolConfig::default());
        let recorder = Arc::new(Recorder::default());

        let status = volume_loader
            .load(&volume, VolumeLoadOptions::default().with_listener(recorder.clone()))
            .wait()
            .await;

        assert_eq!(status.state, LoadState::Done);
        assert_eq!(status.failed, 1);
        assert_eq!(
            *recorder.errors.lock(),
            vec![("f1".to_string(), false, "timeout".to_string())]
        );
    }

    #[tokio::test]
    async fn test_fail_volume_policy() {
        let loader = Arc::new(ScriptedLoader::new(4));
        loader.fail("f0", vec![LoadError::permanent("404")]);
        let (volume_loader, volume) = setup(2, loader.clone(), RequestPoolConfig::default());

        let status = volume_loader
            .load(
                &volume,
                VolumeLoadOptions::default().with_failure_policy(FailurePolicy::FailVolume),
            )
            .wait()
            .await;

        assert_eq!(status.state, LoadState::Failed);
        assert_eq!(volume.state(), LoadState::Failed);
    }

    #[tokio::test]
    async fn test_refinement_skips_frames_at_target() {
        let loader = Arc::new(ScriptedLoader::new(4));
        let (volume_loader, volume) = setup(3, loader.clone(), RequestPoolConfig::default());
        volume
            .commit_frame(1, ImageQualityStatus::FullResolution, &[7; 4])
            .unwrap();

        volume_loader
            .load(&volume, VolumeLoadOptions::default())
            .wait()
            .await;

        assert_eq!(loader.calls(), ["f0", "f2"]);
        assert_eq!(volume.arena().read_frame(1).unwrap(), vec![7; 4]);
    }

    #[tokio::test]
    async fn test_load_and_cache_image() {
        let loader = Arc::new(ScriptedLoader::new(4));
        let (volume_loader, _) = setup(1, loader.clone(), RequestPoolConfig::default());
        let cache = crate::cache::Cache::shared(1024);

        let first = volume_loader
            .load_and_cache_image(&cache, "f7", RequestType::Thumbnail, 0)
            .await
            .unwrap();
        let second = volume_loader
            .load_and_cache_image(&cache, "f7", RequestType::Thumbnail, 0)
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loader.calls(), ["f7"]);
        assert_eq!(cache.lock().size_in_bytes(), 4);
    }

    #[test]
    fn test_create_and_cache_volume_reuses_entry() {
        let (volume_loader, _) = setup(2, Arc::new(ScriptedLoader::new(4)), RequestPoolConfig::default());
        let cache = crate::cache::Cache::shared(1024);

        let a = volume_loader
            .create_and_cache_volume(&cache, "ct", ids(2), SortBy::None)
            .unwrap();
        let b = volume_loader
            .create_and_cache_volume(&cache, "ct", ids(2), SortBy::None)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.lock().len(), 1);
    }

    #[test]
    fn test_retry_delay_backoff() {
        let retry = RetryPolicy::new(3, Duration::from_millis(10));
        assert_eq!(retry.delay(0), Duration::from_millis(10));
        assert_eq!(retry.delay(2), Duration::from_millis(40));
    }
}
