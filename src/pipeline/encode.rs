//! Image encoding for the package and for vision providers.
//!
//! Figures are packaged as PNG (lossless, keeps line art and text crisp);
//! the auto cover is a JPEG since it is a full-page photo-like render and
//! readers show it at thumbnail size.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use tracing::debug;

/// JPEG quality for the auto cover.
const COVER_JPEG_QUALITY: u8 = 85;

/// Encode as 8-bit RGB PNG.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut buf = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

/// Encode as baseline RGB JPEG.
pub fn encode_jpeg(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let rgb = img.to_rgb8();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, COVER_JPEG_QUALITY).encode_image(&rgb)?;
    Ok(buf)
}

/// Encode a rendered page as a base64 PNG attachment for a vision provider.
///
/// `detail: "high"` asks GPT-4-class models for the full tile budget;
/// without it fine print is lost.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let buf = encode_png(img)?;
    let b64 = STANDARD.encode(&buf);
    debug!("Encoded page → {} bytes base64", b64.len());
    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{LumaA, Rgba, RgbaImage};

    #[test]
    fn png_is_rgb() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 3, Rgba([255, 0, 0, 128])));
        let bytes = encode_png(&img).unwrap();
        let back = image::load_from_memory(&bytes).unwrap();
        assert_eq!(back.color(), image::ColorType::Rgb8);
        assert_eq!((back.width(), back.height()), (4, 3));
    }

    #[test]
    fn grey_alpha_converts_to_jpeg() {
        let img = DynamicImage::ImageLumaA8(image::ImageBuffer::from_pixel(8, 8, LumaA([40u8, 255])));
        let bytes = encode_jpeg(&img).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn encode_page_is_base64_png() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let data = encode_page(&img).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(&decoded[1..4], b"PNG");
    }
}
