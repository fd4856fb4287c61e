//! Typed metadata lookup for images.
//!
//! Volume creation needs per-image geometry and scaling. Rather than handing
//! around property bags, providers answer a [`MetadataModule`] query with the
//! matching [`Metadata`] variant.

use std::collections::HashMap;

use dicom::object::{FileDicomObject, InMemDicomObject};
use dicom_dictionary_std::tags;
use parking_lot::RwLock;

use crate::ImageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataModule {
    ImagePixel,
    ImagePlane,
    ModalityLut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImagePixelModule {
    pub rows: u32,
    pub columns: u32,
    pub bits_allocated: u16,
    /// 0 for unsigned, 1 for two's complement.
    pub pixel_representation: u16,
    pub samples_per_pixel: u16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImagePlaneModule {
    /// (row spacing, column spacing)
    pub pixel_spacing: (f32, f32),
    pub slice_thickness: f32,
    pub image_position: Option<[f32; 3]>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModalityLutModule {
    pub rescale_slope: f32,
    pub rescale_intercept: f32,
}

impl ModalityLutModule {
    pub fn is_identity(&self) -> bool {
        self.rescale_slope == 1.0 && self.rescale_intercept == 0.0
    }
}

impl Default for ModalityLutModule {
    fn default() -> Self {
        Self {
            rescale_slope: 1.0,
            rescale_intercept: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Metadata {
    ImagePixel(ImagePixelModule),
    ImagePlane(ImagePlaneModule),
    ModalityLut(ModalityLutModule),
}

impl Metadata {
    pub fn module(&self) -> MetadataModule {
        match self {
            Self::ImagePixel(_) => MetadataModule::ImagePixel,
            Self::ImagePlane(_) => MetadataModule::ImagePlane,
            Self::ModalityLut(_) => MetadataModule::ModalityLut,
        }
    }
}

/// Synchronous metadata lookup.
pub trait MetadataProvider: Send + Sync {
    fn get(&self, module: MetadataModule, image_id: &str) -> Option<Metadata>;

    fn image_pixel(&self, image_id: &str) -> Option<ImagePixelModule> {
        match self.get(MetadataModule::ImagePixel, image_id)? {
            Metadata::ImagePixel(module) => Some(module),
            _ => None,
        }
    }

    fn image_plane(&self, image_id: &str) -> Option<ImagePlaneModule> {
        match self.get(MetadataModule::ImagePlane, image_id)? {
            Metadata::ImagePlane(module) => Some(module),
            _ => None,
        }
    }

    fn modality_lut(&self, image_id: &str) -> Option<ModalityLutModule> {
        match self.get(MetadataModule::ModalityLut, image_id)? {
            Metadata::ModalityLut(module) => Some(module),
            _ => None,
        }
    }
}

/// Map-backed provider. Callers register modules as they learn them.
#[derive(Default)]
pub struct InMemoryMetadataProvider {
    modules: RwLock<HashMap<(ImageId, MetadataModule), Metadata>>,
}

impl InMemoryMetadataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, image_id: impl Into<ImageId>, metadata: Metadata) {
        self.modules
            .write()
            .insert((image_id.into(), metadata.module()), metadata);
    }

    pub fn remove(&self, image_id: &str) {
        self.modules.write().retain(|(id, _), _| id != image_id);
    }
}

impl MetadataProvider for InMemoryMetadataProvider {
    fn get(&self, module: MetadataModule, image_id: &str) -> Option<Metadata> {
        self.modules
            .read()
            .get(&(image_id.to_owned(), module))
            .cloned()
    }
}

/// Provider reading modules from already parsed DICOM objects.
#[derive(Default)]
pub struct DicomMetadataProvider {
    objects: HashMap<ImageId, FileDicomObject<InMemDicomObject>>,
}

impl DicomMetadataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, image_id: impl Into<ImageId>, object: FileDicomObject<InMemDicomObject>) {
        self.objects.insert(image_id.into(), object);
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn read_image_pixel(object: &FileDicomObject<InMemDicomObject>) -> Option<ImagePixelModule> {
        let read_u16 = |tag| object.element(tag).ok()?.to_int::<u16>().ok();
        Some(ImagePixelModule {
            rows: read_u16(tags::ROWS)? as u32,
            columns: read_u16(tags::COLUMNS)? as u32,
            bits_allocated: read_u16(tags::BITS_ALLOCATED)?,
            pixel_representation: read_u16(tags::PIXEL_REPRESENTATION).unwrap_or(0),
            samples_per_pixel: read_u16(tags::SAMPLES_PER_PIXEL).unwrap_or(1),
        })
    }

    fn read_image_plane(object: &FileDicomObject<InMemDicomObject>) -> Option<ImagePlaneModule> {
        let pixel_spacing = object
            .element(tags::PIXEL_SPACING)
            .ok()?
            .to_multi_float32()
            .ok()?;
        let slice_thickness = object
            .element(tags::SLICE_THICKNESS)
            .ok()?
            .to_float32()
            .ok()?;
        let image_position = object
            .element(tags::IMAGE_POSITION_PATIENT)
            .ok()
            .and_then(|element| element.to_multi_float32().ok())
            .and_then(|pos| Some([*pos.first()?, *pos.get(1)?, *pos.get(2)?]));

        Some(ImagePlaneModule {
            pixel_spacing: (*pixel_spacing.first()?, *pixel_spacing.get(1)?),
            slice_thickness,
            image_position,
        })
    }

    fn read_modality_lut(object: &FileDicomObject<InMemDicomObject>) -> ModalityLutModule {
        let read_f32 = |tag| object.element(tag).ok()?.to_float32().ok();
        let defaults = ModalityLutModule::default();
        ModalityLutModule {
            rescale_slope: read_f32(tags::RESCALE_SLOPE).unwrap_or(defaults.rescale_slope),
            rescale_intercept: read_f32(tags::RESCALE_INTERCEPT)
                .unwrap_or(defaults.rescale_intercept),
        }
    }
}

impl MetadataProvider for DicomMetadataProvider {
    fn get(&self, module: MetadataModule, image_id: &str) -> Option<Metadata> {
        let object = self.objects.get(image_id)?;
        match module {
            MetadataModule::ImagePixel => Self::read_image_pixel(object).map(Metadata::ImagePixel),
            MetadataModule::ImagePlane => Self::read_image_plane(object).map(Metadata::ImagePlane),
            MetadataModule::ModalityLut => {
                Some(Metadata::ModalityLut(Self::read_modality_lut(object)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel_module() -> ImagePixelModule {
        ImagePixelModule {
            rows: 2,
            columns: 3,
            bits_allocated: 16,
            pixel_representation: 0,
            samples_per_pixel: 1,
        }
    }

    #[test]
    fn test_in_memory_typed_lookup() {
        let provider = InMemoryMetadataProvider::new();
        provider.insert("img-1", Metadata::ImagePixel(pixel_module()));

        assert_eq!(provider.image_pixel("img-1"), Some(pixel_module()));
        assert_eq!(provider.image_plane("img-1"), None);
        assert_eq!(provider.image_pixel("img-2"), None);
    }

    #[test]
    fn test_in_memory_remove() {
        let provider = InMemoryMetadataProvider::new();
        provider.insert("img-1", Metadata::ImagePixel(pixel_module()));
        provider.insert("img-1", Metadata::ModalityLut(ModalityLutModule::default()));
        provider.remove("img-1");
        assert!(provider.get(MetadataModule::ModalityLut, "img-1").is_none());
    }

    #[test]
    fn test_modality_identity() {
        assert!(ModalityLutModule::default().is_identity());
        let scaled = ModalityLutModule {
            rescale_slope: 1.0,
            rescale_intercept: -1024.0,
        };
        assert!(!scaled.is_identity());
    }

    #[test]
    fn test_empty_dicom_provider() {
        let provider = DicomMetadataProvider::new();
        assert!(provider.is_empty());
        assert!(provider.get(MetadataModule::ImagePixel, "missing").is_none());
    }
}
