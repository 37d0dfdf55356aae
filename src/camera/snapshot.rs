use std::io::Cursor;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{DynamicImage, ImageOutputFormat};

use crate::common::{FaceLinkError, Result};

pub const JPEG_DATA_URI_PREFIX: &str = "data:image/jpeg;base64,";

/// Centre crop to a 3:4 portrait.
pub fn crop_portrait(frame: &DynamicImage) -> DynamicImage {
    let (width, height) = (frame.width(), frame.height());
    if width == 0 || height == 0 {
        return frame.clone();
    }

    // Width that makes width:height == 3:4 at full height.
    let target_width = height * 3 / 4;
    if target_width <= width {
        let x = (width - target_width) / 2;
        frame.crop_imm(x, 0, target_width.max(1), height)
    } else {
        let target_height = width * 4 / 3;
        let y = (height - target_height) / 2;
        frame.crop_imm(0, y, width, target_height.max(1))
    }
}

/// Crops, encodes as JPEG and wraps the result in a data URI.
pub fn encode_portrait_data_uri(frame: &DynamicImage, quality: u8) -> Result<String> {
    let portrait = DynamicImage::ImageRgb8(crop_portrait(frame).to_rgb8());
    let mut bytes = Cursor::new(Vec::new());
    portrait.write_to(&mut bytes, ImageOutputFormat::Jpeg(quality.clamp(1, 100)))?;

    Ok(format!("{}{}", JPEG_DATA_URI_PREFIX, STANDARD.encode(bytes.into_inner())))
}

/// Loads an image file of any supported format as a portrait JPEG data URI.
pub fn file_to_data_uri(path: &std::path::Path, quality: u8) -> Result<String> {
    let img = image::open(path)?;
    encode_portrait_data_uri(&img, quality)
}

/// Decodes a `data:image/...;base64,` URI back into an image.
pub fn decode_data_uri(uri: &str) -> Result<DynamicImage> {
    let payload = uri
        .strip_prefix("data:image/")
        .and_then(|rest| rest.split_once(";base64,"))
        .map(|(_, payload)| payload)
        .ok_or_else(|| FaceLinkError::Validation("not an image data URI".into()))?;

    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| FaceLinkError::Validation(format!("invalid base64 image: {}", e)))?;
    Ok(image::load_from_memory(&bytes)?)
}
