//! Image payload codec: data URLs, base64 and RGB decoding.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::{ImageFormat, RgbImage};
use std::io::Cursor;
use thiserror::Error;

const JPEG_DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty image payload")]
    Empty,
    #[error("malformed data URL: {0}")]
    DataUrl(String),
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Decode a `data:<mime>;base64,<payload>` URL, or bare base64, to raw bytes.
pub fn decode_data_url(input: &str) -> Result<Vec<u8>, DecodeError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(DecodeError::Empty);
    }

    let payload = match input.strip_prefix("data:") {
        Some(rest) => {
            let (header, payload) = rest
                .split_once(',')
                .ok_or_else(|| DecodeError::DataUrl("missing ',' separator".into()))?;
            if !header.ends_with(";base64") {
                return Err(DecodeError::DataUrl(format!("unsupported encoding: {header}")));
            }
            payload
        }
        None => input,
    };

    let bytes = STANDARD.decode(payload)?;
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(bytes)
}

/// Decode any supported image container to 8-bit RGB. Grayscale inputs are
/// expanded to three equal channels.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, DecodeError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Encode a frame as a JPEG data URL.
pub fn encode_jpeg_data_url(frame: &RgbImage) -> Result<String, DecodeError> {
    let mut buf = Cursor::new(Vec::new());
    frame.write_to(&mut buf, ImageFormat::Jpeg)?;
    Ok(format!("{JPEG_DATA_URL_PREFIX}{}", STANDARD.encode(buf.into_inner())))
}
