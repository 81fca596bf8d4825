use std::io::Cursor;

use image::{DynamicImage, ImageReader, RgbImage, RgbaImage, imageops::FilterType};
use thiserror::Error;
use tracing::{debug, instrument};

pub const COMPRESSED_CONTENT_TYPE: &str = "image/jpeg";
pub const COMPRESSED_EXTENSION: &str = "jpg";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompressOptions {
    /// JPEG quality, 1-100
    pub quality: u8,
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self {
            quality: 85,
            max_width: 1920,
            max_height: 1920,
        }
    }
}

#[derive(Debug)]
pub struct CompressedImage {
    pub data: Vec<u8>,
    /// Encoded size in whole kilobytes, truncated
    pub size_kb: u64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Error)]
pub enum ImageCompressError {
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to read image: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to encode image: {0}")]
    Encode(#[source] std::io::Error),
}

/// Decodes `data`, flattens any transparency onto white, shrinks it to fit the bounds
/// (never enlarging), and re-encodes it as JPEG with optimized Huffman tables.
///
/// # Errors
/// Will return [`Err`] if the input can't be decoded (corrupt or unsupported format)
/// or the result can't be encoded.
#[instrument(skip(data), fields(input_len = data.len()))]
pub fn compress_image(
    data: &[u8],
    options: CompressOptions,
) -> Result<CompressedImage, ImageCompressError> {
    let decoded = ImageReader::new(Cursor::new(data))
        .with_guessed_format()?
        .decode()
        .map_err(ImageCompressError::Decode)?;
    let (orig_width, orig_height) = (decoded.width(), decoded.height());

    let opaque = if decoded.color().has_alpha() {
        flatten_onto_white(&decoded.to_rgba8())
    } else {
        decoded.to_rgb8()
    };

    let resized = fit_within(
        DynamicImage::ImageRgb8(opaque),
        options.max_width,
        options.max_height,
    )
    .into_rgb8();

    let encoded = encode_jpeg(&resized, options.quality.clamp(1, 100))
        .map_err(ImageCompressError::Encode)?;

    let compressed = CompressedImage {
        size_kb: encoded.len() as u64 / 1024,
        width: resized.width(),
        height: resized.height(),
        data: encoded,
    };
    debug!(
        orig_width,
        orig_height,
        width = compressed.width,
        height = compressed.height,
        output_len = compressed.data.len(),
        "Compressed image"
    );
    Ok(compressed)
}

fn encode_jpeg(rgb: &RgbImage, quality: u8) -> std::io::Result<Vec<u8>> {
    let mut compress = mozjpeg::Compress::new(mozjpeg::ColorSpace::JCS_RGB);
    compress.set_size(rgb.width() as usize, rgb.height() as usize);
    compress.set_quality(f32::from(quality));
    compress.set_optimize_coding(true);

    let mut started = compress.start_compress(Vec::new())?;
    started.write_scanlines(rgb)?;
    started.finish()
}

/// Alpha-composites every pixel over an opaque white background.
fn flatten_onto_white(rgba: &RgbaImage) -> RgbImage {
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let alpha = u16::from(a);
        let blend = |channel: u8| {
            let mixed = (u16::from(channel) * alpha + 255 * (255 - alpha) + 127) / 255;
            u8::try_from(mixed).unwrap_or(u8::MAX)
        };
        image::Rgb([blend(r), blend(g), blend(b)])
    })
}

fn fit_within(image: DynamicImage, max_width: u32, max_height: u32) -> DynamicImage {
    if image.width() <= max_width && image.height() <= max_height {
        return image;
    }
    // NOTE: resize keeps the aspect ratio and fits both sides inside the bounds
    image.resize(max_width.max(1), max_height.max(1), FilterType::Lanczos3)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use image::{ImageFormat, Rgb, Rgba, codecs::jpeg::JpegEncoder};

    use super::*;

    fn encode(image: &DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut buffer = Vec::new();
        image.write_to(&mut Cursor::new(&mut buffer), format).unwrap();
        buffer
    }

    fn decode(data: &[u8]) -> DynamicImage {
        image::load_from_memory(data).unwrap()
    }

    #[test]
    fn test_small_image_keeps_dimensions() {
        let input = DynamicImage::ImageRgb8(RgbImage::from_pixel(300, 200, Rgb([10, 200, 30])));
        let compressed =
            compress_image(&encode(&input, ImageFormat::Png), CompressOptions::default()).unwrap();

        assert_eq!((compressed.width, compressed.height), (300, 200));
        let output = decode(&compressed.data);
        assert_eq!((output.width(), output.height()), (300, 200));
        assert_eq!(
            image::guess_format(&compressed.data).unwrap(),
            ImageFormat::Jpeg
        );
    }

    #[test]
    fn test_large_image_fits_bounds_and_keeps_ratio() {
        let input = DynamicImage::ImageRgb8(RgbImage::from_pixel(4000, 1000, Rgb([0, 0, 0])));
        let compressed =
            compress_image(&encode(&input, ImageFormat::Png), CompressOptions::default()).unwrap();

        let output = decode(&compressed.data);
        assert!(output.width() <= 1920 && output.height() <= 1920);
        assert_eq!(output.width(), 1920);
        assert_eq!(output.height(), 480);
    }

    #[test]
    fn test_tall_image_fits_custom_bounds() {
        let input = DynamicImage::ImageRgb8(RgbImage::from_pixel(300, 900, Rgb([50, 50, 50])));
        let options = CompressOptions {
            quality: 60,
            max_width: 200,
            max_height: 200,
        };
        let compressed = compress_image(&encode(&input, ImageFormat::Png), options).unwrap();

        let output = decode(&compressed.data);
        assert!(output.height() <= 200 && output.width() <= 200);
        let ratio = f64::from(output.width()) / f64::from(output.height());
        assert!((ratio - 300.0 / 900.0).abs() < 0.02, "ratio was {ratio}");
    }

    #[test]
    fn test_transparency_is_flattened_onto_white() {
        let input =
            DynamicImage::ImageRgba8(RgbaImage::from_pixel(16, 16, Rgba([0, 0, 0, 0])));
        let compressed =
            compress_image(&encode(&input, ImageFormat::Png), CompressOptions::default()).unwrap();

        let output = decode(&compressed.data).to_rgb8();
        let Rgb([r, g, b]) = *output.get_pixel(8, 8);
        assert!(r > 245 && g > 245 && b > 245, "got {r},{g},{b}");
    }

    #[test]
    fn test_flatten_blends_partial_alpha() {
        let rgba = RgbaImage::from_pixel(1, 1, Rgba([0, 0, 0, 128]));
        let Rgb([r, g, b]) = *flatten_onto_white(&rgba).get_pixel(0, 0);
        assert_eq!((r, g, b), (127, 127, 127));

        let opaque = RgbaImage::from_pixel(1, 1, Rgba([12, 34, 56, 255]));
        assert_eq!(flatten_onto_white(&opaque).get_pixel(0, 0).0, [12, 34, 56]);
    }

    #[test]
    fn test_size_kb_truncates() {
        let input = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 64, Rgb([1, 2, 3])));
        let compressed =
            compress_image(&encode(&input, ImageFormat::Png), CompressOptions::default()).unwrap();
        assert_eq!(compressed.size_kb, compressed.data.len() as u64 / 1024);
    }

    #[test]
    fn test_output_is_no_larger_than_plain_jpeg() {
        let rgb = RgbImage::from_fn(640, 480, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 5 % 256) as u8, ((x ^ y) % 256) as u8])
        });
        let input = encode(&DynamicImage::ImageRgb8(rgb.clone()), ImageFormat::Png);
        let compressed = compress_image(&input, CompressOptions::default()).unwrap();

        let mut plain = Vec::new();
        JpegEncoder::new_with_quality(&mut plain, 85)
            .encode_image(&rgb)
            .unwrap();

        assert!(
            compressed.data.len() <= plain.len(),
            "optimized {} bytes vs plain {} bytes",
            compressed.data.len(),
            plain.len()
        );
        assert_eq!(decode(&compressed.data).width(), 640);
    }

    #[test]
    fn test_corrupt_input_fails() {
        let err = compress_image(b"definitely not an image", CompressOptions::default())
            .unwrap_err();
        assert!(matches!(err, ImageCompressError::Decode(_)));
    }

    #[test]
    fn test_truncated_png_fails() {
        let input = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 64, Rgb([1, 2, 3])));
        let png = encode(&input, ImageFormat::Png);
        assert!(compress_image(&png[..png.len() / 2], CompressOptions::default()).is_err());
    }
}
