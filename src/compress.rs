//! Shrinks photo attachments before they are stored or uploaded.
//!
//! Resize so the longest side fits `max_dimension`, then walk JPEG quality
//! down from [`START_QUALITY`] in steps of [`QUALITY_STEP`] until the output
//! fits `target_bytes` or [`MIN_QUALITY`] is reached.
use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, GenericImageView};
use tracing::{debug, warn};

use crate::config::Images;
use crate::model::AttachedFile;

pub const START_QUALITY: u8 = 85;
pub const QUALITY_STEP: u8 = 10;
pub const MIN_QUALITY: u8 = 45;

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
        .context("failed to encode jpeg")?;
    Ok(out)
}

/// Compress raw image bytes. Returns `None` when the original should be kept.
pub fn compress_image(bytes: &[u8], limits: &Images) -> Result<Option<Vec<u8>>> {
    let img = image::load_from_memory(bytes).context("failed to decode image")?;
    let (w, h) = img.dimensions();
    let resized = w.max(h) > limits.max_dimension;
    let img = if resized {
        img.resize(limits.max_dimension, limits.max_dimension, FilterType::Triangle)
    } else {
        img
    };

    let mut quality = START_QUALITY;
    let mut out = encode_jpeg(&img, quality)?;
    while out.len() > limits.target_bytes && quality > MIN_QUALITY {
        quality = quality.saturating_sub(QUALITY_STEP).max(MIN_QUALITY);
        out = encode_jpeg(&img, quality)?;
    }
    debug!(
        from = bytes.len(),
        to = out.len(),
        quality,
        resized,
        "compressed image"
    );

    if !resized && out.len() >= bytes.len() {
        return Ok(None);
    }
    Ok(Some(out))
}

/// Compress every image attachment in place. Undecodable files pass through.
pub fn compress_attachments(files: Vec<AttachedFile>, limits: &Images) -> Vec<AttachedFile> {
    files
        .into_iter()
        .map(|file| {
            if !file.is_image() {
                return file;
            }
            match compress_image(&file.bytes, limits) {
                Ok(Some(bytes)) => AttachedFile {
                    file_name: jpeg_name(&file.file_name),
                    content_type: "image/jpeg".to_string(),
                    bytes,
                    field: file.field,
                },
                Ok(None) => file,
                Err(err) => {
                    warn!(?err, field = %file.field, "keeping attachment uncompressed");
                    file
                }
            }
        })
        .collect()
}

fn jpeg_name(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => format!("{}.jpg", stem),
        _ => format!("{}.jpg", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageOutputFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x ^ y) % 256) as u8])
        });
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn large_photo_is_resized_to_max_dimension() {
        let limits = Images {
            max_dimension: 400,
            target_bytes: 1024 * 1024,
        };
        let out = compress_image(&png(1200, 600), &limits).unwrap().unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!(decoded.dimensions(), (400, 200));
    }

    #[test]
    fn tight_budget_bottoms_out_at_min_quality() {
        let limits = Images {
            max_dimension: 800,
            target_bytes: 1,
        };
        let out = compress_image(&png(800, 800), &limits).unwrap().unwrap();
        let floor = encode_jpeg(&image::load_from_memory(&png(800, 800)).unwrap(), MIN_QUALITY).unwrap();
        assert_eq!(out.len(), floor.len());
    }

    #[test]
    fn non_images_and_garbage_pass_through() {
        let limits = Images::default();
        let pdf = AttachedFile {
            field: "factura".into(),
            file_name: "factura.pdf".into(),
            content_type: "application/pdf".into(),
            bytes: vec![1, 2, 3],
        };
        let broken = AttachedFile {
            field: "foto".into(),
            file_name: "foto.png".into(),
            content_type: "image/png".into(),
            bytes: vec![0, 1, 2, 3],
        };
        let out = compress_attachments(vec![pdf.clone(), broken.clone()], &limits);
        assert_eq!(out, vec![pdf, broken]);
    }

    #[test]
    fn compressed_attachment_is_renamed_jpeg() {
        let limits = Images {
            max_dimension: 300,
            target_bytes: 1024 * 1024,
        };
        let photo = AttachedFile {
            field: "foto_cama".into(),
            file_name: "IMG_0001.png".into(),
            content_type: "image/png".into(),
            bytes: png(900, 900),
        };
        let out = compress_attachments(vec![photo], &limits);
        assert_eq!(out[0].file_name, "IMG_0001.jpg");
        assert_eq!(out[0].content_type, "image/jpeg");
        assert_eq!(out[0].field, "foto_cama");
    }

    #[test]
    fn jpeg_name_handles_missing_extension() {
        assert_eq!(jpeg_name("foto"), "foto.jpg");
        assert_eq!(jpeg_name(".hidden"), ".hidden.jpg");
        assert_eq!(jpeg_name("a.b.png"), "a.b.jpg");
    }
}
