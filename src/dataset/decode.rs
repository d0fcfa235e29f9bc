//! Image decoding with tolerance for truncated JPEG and PNG files.

use std::io::Cursor;
use std::path::Path;

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageReader, Rgb, RgbImage};

use crate::utils::error::{Result, SorghumError};

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];
const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

fn decode_error(path: &Path, reason: impl Into<String>) -> SorghumError {
    SorghumError::Decode {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn decode_bytes(bytes: &[u8]) -> std::result::Result<DynamicImage, String> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| e.to_string())?
        .decode()
        .map_err(|e| e.to_string())
}

fn png_pixel(color: png::ColorType, px: &[u8]) -> Rgb<u8> {
    match color {
        png::ColorType::Grayscale | png::ColorType::GrayscaleAlpha => Rgb([px[0]; 3]),
        _ => Rgb([px[0], px[1], px[2]]),
    }
}

/// Decode the rows of a PNG stream that arrive before it breaks off.
///
/// Returns the image and the number of decoded rows; missing rows stay black.
fn decode_partial_png(bytes: &[u8]) -> std::result::Result<(RgbImage, u32), String> {
    let mut decoder = png::Decoder::new(Cursor::new(bytes));
    decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
    let mut reader = decoder.read_info().map_err(|e| e.to_string())?;

    let (width, height, interlaced) = {
        let info = reader.info();
        (info.width, info.height, info.interlaced)
    };
    if interlaced {
        return Err("truncated interlaced PNG".to_string());
    }
    let (color, _) = reader.output_color_type();
    if color == png::ColorType::Indexed {
        return Err("unexpanded palette PNG".to_string());
    }
    let samples = color.samples();

    let mut img = RgbImage::new(width, height);
    let mut rows = 0;
    while rows < height {
        let row = match reader.next_row() {
            Ok(Some(row)) => row,
            Ok(None) | Err(_) => break,
        };
        for (x, px) in row
            .data()
            .chunks_exact(samples)
            .take(width as usize)
            .enumerate()
        {
            img.put_pixel(x as u32, rows, png_pixel(color, px));
        }
        rows += 1;
    }

    if rows == 0 {
        return Err("no image rows before end of data".to_string());
    }
    Ok((img, rows))
}

/// Decode an in-memory image to 8-bit RGB.
///
/// A JPEG stream cut off before its end-of-image marker is terminated and
/// decoded again, keeping whatever scan data is present. A cut-off PNG keeps
/// the rows decoded before the break and fills the rest with black.
pub fn decode_rgb(bytes: &[u8], path: &Path) -> Result<RgbImage> {
    if bytes.is_empty() {
        return Err(decode_error(path, "file is empty"));
    }

    match decode_bytes(bytes) {
        Ok(img) => Ok(img.to_rgb8()),
        Err(first) if bytes.starts_with(&JPEG_SOI) && !bytes.ends_with(&JPEG_EOI) => {
            let mut patched = Vec::with_capacity(bytes.len() + JPEG_EOI.len());
            patched.extend_from_slice(bytes);
            patched.extend_from_slice(&JPEG_EOI);

            let img = decode_bytes(&patched).map_err(|_| decode_error(path, first))?;
            tracing::warn!("Decoded truncated image {}", path.display());
            Ok(img.to_rgb8())
        }
        Err(first) if bytes.starts_with(&PNG_SIGNATURE) => {
            let (img, rows) = decode_partial_png(bytes).map_err(|_| decode_error(path, first))?;
            tracing::warn!(
                "Decoded truncated image {} ({} of {} rows)",
                path.display(),
                rows,
                img.height()
            );
            Ok(img)
        }
        Err(reason) => Err(decode_error(path, reason)),
    }
}

/// Read and decode an image file to 8-bit RGB
pub fn load_rgb(path: &Path) -> Result<RgbImage> {
    let bytes = std::fs::read(path).map_err(|e| decode_error(path, e.to_string()))?;
    decode_rgb(&bytes, path)
}

/// Resize to exactly `size x size`, ignoring aspect ratio. No-op when already square at `size`.
pub fn resize_square(img: RgbImage, size: u32) -> RgbImage {
    if img.dimensions() == (size, size) {
        return img;
    }
    imageops::resize(&img, size, size, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageFormat;
    use tempfile::tempdir;

    fn encoded(format: ImageFormat, width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 8) as u8, (y * 8) as u8, 90])
        });
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, format)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_decode_png() {
        let bytes = encoded(ImageFormat::Png, 20, 10);
        let img = decode_rgb(&bytes, Path::new("leaf.png")).unwrap();
        assert_eq!(img.dimensions(), (20, 10));
        assert_eq!(img.get_pixel(2, 1), &Rgb([16, 8, 90]));
    }

    #[test]
    fn test_empty_bytes_fail() {
        let err = decode_rgb(&[], Path::new("empty.jpeg")).unwrap_err();
        assert!(matches!(err, SorghumError::Decode { .. }));
    }

    #[test]
    fn test_garbage_bytes_fail() {
        let err = decode_rgb(b"not an image at all", Path::new("junk.png")).unwrap_err();
        assert!(matches!(err, SorghumError::Decode { .. }));
    }

    #[test]
    fn test_jpeg_without_end_marker_decodes() {
        let mut bytes = encoded(ImageFormat::Jpeg, 32, 32);
        assert!(bytes.ends_with(&JPEG_EOI));
        bytes.truncate(bytes.len() - 2);

        let img = decode_rgb(&bytes, Path::new("cut.jpeg")).unwrap();
        assert_eq!(img.dimensions(), (32, 32));
    }

    /// Noisy pixels so the compressed data scales with the row count
    fn encoded_noise(format: ImageFormat, size: u32) -> (RgbImage, Vec<u8>) {
        let img = RgbImage::from_fn(size, size, |x, y| {
            let mut v = (y * size + x).wrapping_mul(0x9E37_79B1);
            v ^= v >> 15;
            v = v.wrapping_mul(0x85EB_CA6B);
            v ^= v >> 13;
            Rgb([(v >> 8) as u8, (v >> 16) as u8, (v >> 24) as u8])
        });
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img.clone())
            .write_to(&mut buf, format)
            .unwrap();
        (img, buf.into_inner())
    }

    #[test]
    fn test_jpeg_cut_mid_scan_decodes() {
        let (_, bytes) = encoded_noise(ImageFormat::Jpeg, 64);
        let cut = &bytes[..bytes.len() * 3 / 5];

        let img = decode_rgb(cut, Path::new("cut.jpeg")).unwrap();
        assert_eq!(img.dimensions(), (64, 64));
    }

    #[test]
    fn test_truncated_png_keeps_decoded_rows() {
        let (original, bytes) = encoded_noise(ImageFormat::Png, 64);
        let cut = &bytes[..bytes.len() * 3 / 5];
        assert!(decode_bytes(cut).is_err());

        let img = decode_rgb(cut, Path::new("cut.png")).unwrap();
        assert_eq!(img.dimensions(), (64, 64));
        for x in 0..64 {
            assert_eq!(img.get_pixel(x, 0), original.get_pixel(x, 0));
            assert_eq!(img.get_pixel(x, 63), &Rgb([0, 0, 0]));
        }
    }

    #[test]
    fn test_png_cut_before_image_data_fails() {
        let (_, bytes) = encoded_noise(ImageFormat::Png, 16);
        let err = decode_rgb(&bytes[..40], Path::new("header.png")).unwrap_err();
        assert!(matches!(err, SorghumError::Decode { .. }));
    }

    #[test]
    fn test_missing_file_fails() {
        let dir = tempdir().unwrap();
        let err = load_rgb(&dir.path().join("absent.png")).unwrap_err();
        assert!(matches!(err, SorghumError::Decode { .. }));
    }

    #[test]
    fn test_resize_square() {
        let img = RgbImage::new(40, 12);
        assert_eq!(resize_square(img, 16).dimensions(), (16, 16));

        let square = RgbImage::from_pixel(8, 8, Rgb([1, 2, 3]));
        assert_eq!(resize_square(square.clone(), 8), square);
    }
}
