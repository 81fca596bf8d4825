use std::io::Cursor;

use image::{DynamicImage, ImageFormat, Luma};
use qrcode::{EcLevel, QrCode, types::QrError};
use thiserror::Error;
use tracing::instrument;

pub const QR_CONTENT_TYPE: &str = "image/png";
pub const QR_EXTENSION: &str = "png";

/// Pixels per QR module.
const MODULE_SIZE: u32 = 10;

#[derive(Debug)]
pub struct QrImage {
    pub data: Vec<u8>,
    pub content_type: &'static str,
}

#[derive(Debug, Error)]
pub enum QrEncodeError {
    #[error("failed to build QR code: {0}")]
    Build(#[from] QrError),
    #[error("failed to encode QR image: {0}")]
    Encode(#[from] image::ImageError),
}

/// Renders `data` as a black-on-white PNG QR code with the standard four-module quiet zone.
///
/// # Errors
/// Will return [`Err`] if `data` doesn't fit in any QR version at the chosen
/// error-correction level, or the PNG can't be encoded.
#[instrument(skip(data), fields(data_len = data.len()))]
pub fn encode_qr(data: &str) -> Result<QrImage, QrEncodeError> {
    let code = QrCode::with_error_correction_level(data.as_bytes(), EcLevel::L)?;
    let rendered = code
        .render::<Luma<u8>>()
        .dark_color(Luma([0]))
        .light_color(Luma([255]))
        .quiet_zone(true)
        .module_dimensions(MODULE_SIZE, MODULE_SIZE)
        .build();

    let mut png = Vec::new();
    DynamicImage::ImageLuma8(rendered).write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
    Ok(QrImage {
        data: png,
        content_type: QR_CONTENT_TYPE,
    })
}
