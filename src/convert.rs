use bytemuck::Pod;
use half::f16;
use rayon::prelude::*;

use crate::arena::ArenaError;
use crate::enums::ElementType;
use crate::metadata::ModalityLutModule;

#[inline]
fn read<T: Pod>(chunk: &[u8]) -> T {
    bytemuck::pod_read_unaligned(chunk)
}

/// Widen raw pixel bytes of `element_type` to `f32`.
pub(crate) fn to_f32(bytes: &[u8], element_type: ElementType) -> Vec<f32> {
    let size = element_type.byte_size();
    let chunks = bytes.par_chunks_exact(size);
    match element_type {
        ElementType::Uint8 => chunks.map(|c| c[0] as f32).collect(),
        ElementType::Int8 => chunks.map(|c| c[0] as i8 as f32).collect(),
        ElementType::Uint16 => chunks.map(|c| read::<u16>(c) as f32).collect(),
        ElementType::Int16 => chunks.map(|c| read::<i16>(c) as f32).collect(),
        ElementType::Float16 => chunks.map(|c| read::<f16>(c).to_f32()).collect(),
        ElementType::Float32 => chunks.map(read::<f32>).collect(),
    }
}

fn store<T: Pod + Send>(
    dst: &mut [u8],
    values: &[f32],
    cast: impl Fn(f32) -> T + Sync,
) -> Result<(), ArenaError> {
    let dst = bytemuck::try_cast_slice_mut::<u8, T>(dst).map_err(|_| ArenaError::Misaligned)?;
    if dst.len() != values.len() {
        return Err(ArenaError::LengthMismatch {
            expected: dst.len() * std::mem::size_of::<T>(),
            actual: values.len() * std::mem::size_of::<T>(),
        });
    }
    dst.par_iter_mut()
        .zip(values.par_iter())
        .for_each(|(out, &value)| *out = cast(value));
    Ok(())
}

/// Convert `src` pixels into `dst`, applying `scaling` on the way.
///
/// Identical element types without scaling are a plain copy.
pub(crate) fn write_converted(
    src: &[u8],
    src_type: ElementType,
    scaling: Option<ModalityLutModule>,
    dst: &mut [u8],
    dst_type: ElementType,
) -> Result<(), ArenaError> {
    let scaling = scaling.filter(|lut| !lut.is_identity());
    if src_type == dst_type && scaling.is_none() {
        if src.len() != dst.len() {
            return Err(ArenaError::LengthMismatch {
                expected: dst.len(),
                actual: src.len(),
            });
        }
        dst.copy_from_slice(src);
        return Ok(());
    }

    let mut values = to_f32(src, src_type);
    if let Some(lut) = scaling {
        values
            .par_iter_mut()
            .for_each(|v| *v = v.mul_add(lut.rescale_slope, lut.rescale_intercept));
    }

    match dst_type {
        ElementType::Uint8 => store::<u8>(dst, &values, |v| v.round() as u8),
        ElementType::Int8 => store::<i8>(dst, &values, |v| v.round() as i8),
        ElementType::Uint16 => store::<u16>(dst, &values, |v| v.round() as u16),
        ElementType::Int16 => store::<i16>(dst, &values, |v| v.round() as i16),
        ElementType::Float16 => store::<f16>(dst, &values, f16::from_f32),
        ElementType::Float32 => store::<f32>(dst, &values, |v| v),
    }
}

/// Map values linearly onto 0..=255 using their own min and max.
pub(crate) fn normalize_to_u8(values: &[f32]) -> Vec<u8> {
    let (min, max) = values
        .par_iter()
        .fold(
            || (f32::INFINITY, f32::NEG_INFINITY),
            |(lo, hi), &v| (lo.min(v), hi.max(v)),
        )
        .reduce(
            || (f32::INFINITY, f32::NEG_INFINITY),
            |(a, b), (c, d)| (a.min(c), b.max(d)),
        );
    let range = max - min;
    if !range.is_finite() || range <= 0.0 {
        return vec![0; values.len()];
    }
    values
        .par_iter()
        .map(|&v| (((v - min) / range) * 255.0).clamp(0.0, 255.0) as u8)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_type_copies() {
        let src = [1u8, 2, 3, 4];
        let mut dst = [0u8; 4];
        write_converted(&src, ElementType::Uint8, None, &mut dst, ElementType::Uint8).unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn test_scaling_into_float32() {
        let src: Vec<u8> = bytemuck::cast_slice(&[0u16, 1000, 2048]).to_vec();
        let mut words = [0u32; 3];
        let dst: &mut [u8] = bytemuck::cast_slice_mut(&mut words);
        let lut = ModalityLutModule {
            rescale_slope: 1.0,
            rescale_intercept: -1024.0,
        };
        write_converted(&src, ElementType::Uint16, Some(lut), dst, ElementType::Float32).unwrap();
        let values: &[f32] = bytemuck::cast_slice(dst);
        assert_eq!(values, &[-1024.0, -24.0, 1024.0]);
    }

    #[test]
    fn test_length_mismatch() {
        let src = [1u8, 2];
        let mut dst = [0u8; 4];
        assert!(write_converted(&src, ElementType::Uint8, None, &mut dst, ElementType::Uint8).is_err());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_to_u8(&[0.0, 50.0, 100.0]), vec![0, 127, 255]);
        assert_eq!(normalize_to_u8(&[5.0, 5.0]), vec![0, 0]);
    }

    #[test]
    fn test_to_f32_signed() {
        let src: Vec<u8> = bytemuck::cast_slice(&[-5i16, 7]).to_vec();
        assert_eq!(to_f32(&src, ElementType::Int16), vec![-5.0, 7.0]);
    }
}
