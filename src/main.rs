use std::{fs, path::PathBuf, sync::Arc};

use dicom::object::open_file;
use dicom_stream::{
    Cache, DecodedImage, DicomFileLoader, DicomMetadataProvider, ImageQualityStatus,
    ProgressiveOrder, RequestPool, SortBy, StreamingConfig, VolumeLoadListener,
    VolumeLoadOptions, VolumeLoader,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

struct Progress;

impl VolumeLoadListener for Progress {
    fn on_frame_loaded(
        &self,
        image_id: &str,
        image_index: usize,
        _image: &DecodedImage,
        status: ImageQualityStatus,
    ) {
        info!(image_id, image_index, %status, "Frame loaded");
    }

    fn on_frame_error(&self, image_id: &str, permanent: bool, reason: &str) {
        warn!(image_id, permanent, reason, "Frame failed");
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let root = PathBuf::from("dicom");
    let mut metadata = DicomMetadataProvider::new();
    let mut image_ids = Vec::new();
    for path in fs::read_dir(&root)
        .expect("should have read dicom directory")
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|s| s.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
        })
    {
        let Some(name) = path.file_name().and_then(|s| s.to_str()).map(str::to_owned) else {
            continue;
        };
        match open_file(&path) {
            Ok(object) => {
                metadata.insert(name.clone(), object);
                image_ids.push(name);
            }
            Err(err) => warn!(path = %path.display(), error = %err, "Skipping unreadable file"),
        }
    }

    let config = StreamingConfig::default();
    let cache = Cache::from_config(&config);
    let pool = RequestPool::new(Arc::new(DicomFileLoader::new(&root)), config.pool.clone());
    let loader = VolumeLoader::new(pool, Arc::new(metadata), config);

    let volume = loader
        .create_and_cache_volume(&cache, "dicom", image_ids, SortBy::ImagePositionPatient)
        .expect("should have created volume from directory");
    cache
        .lock()
        .pin(volume.volume_id())
        .expect("should have cached volume");

    let status = loader
        .load(
            &volume,
            VolumeLoadOptions::default()
                .with_order(ProgressiveOrder::Interleaved {
                    factor: loader.config().interleave_factor,
                })
                .with_replicate(true)
                .with_listener(Arc::new(Progress)),
        )
        .wait()
        .await;
    info!(
        loaded = status.loaded,
        failed = status.failed,
        total = status.total,
        "Volume streamed"
    );

    let image = volume
        .frame_preview(volume.dim().0 / 2)
        .expect("should have returned frame at center of volume");
    image.save("result.png").expect("should have saved preview");
}
