use crate::error::ReplayError;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use image::{DynamicImage, RgbaImage};
use std::path::Path;

/// Raw image bytes from a service response plus the extension to save them with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub bytes: Vec<u8>,
    pub ext: &'static str,
}

impl DecodedImage {
    pub fn dimensions(&self) -> Result<(u32, u32), image::ImageError> {
        let image = image::load_from_memory(&self.bytes)?;
        Ok((image.width(), image.height()))
    }

    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(&self.bytes)
    }
}

pub fn open_image(path: &Path) -> Result<DynamicImage, image::ImageError> {
    image::open(path)
}

/// Decodes to 8-bit RGBA; images without alpha get an opaque channel.
pub fn open_rgba(path: &Path) -> Result<RgbaImage, image::ImageError> {
    Ok(open_image(path)?.to_rgba8())
}

pub fn decode_rgba(bytes: &[u8]) -> Result<RgbaImage, image::ImageError> {
    Ok(image::load_from_memory(bytes)?.to_rgba8())
}

/// Accepts bare base64 or a `data:<mime>;base64,` URI.
pub fn decode_image_payload(payload: &str) -> Result<DecodedImage, ReplayError> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return Err(ReplayError::Payload("empty image payload".to_string()));
    }

    let (mime, b64_data) = if let Some(rest) = trimmed.strip_prefix("data:") {
        let (mime, b64) = rest
            .split_once(";base64,")
            .ok_or_else(|| ReplayError::Payload("malformed data URI payload".to_string()))?;
        (Some(mime), b64)
    } else {
        (None, trimmed)
    };

    let normalized_b64: String = b64_data.chars().filter(|ch| !ch.is_whitespace()).collect();
    let bytes = BASE64_STANDARD
        .decode(normalized_b64.as_bytes())
        .map_err(|error| ReplayError::Payload(format!("base64 decode failed: {}", error)))?;
    if bytes.is_empty() {
        return Err(ReplayError::Payload("decoded payload is empty".to_string()));
    }

    let ext = mime
        .and_then(extension_from_mime)
        .unwrap_or_else(|| extension_from_image_bytes(&bytes));

    Ok(DecodedImage { bytes, ext })
}

fn extension_from_mime(mime: &str) -> Option<&'static str> {
    match mime.trim().to_ascii_lowercase().as_str() {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

fn extension_from_image_bytes(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(image::ImageFormat::Png) => "png",
        Ok(image::ImageFormat::Jpeg) => "jpg",
        Ok(image::ImageFormat::WebP) => "webp",
        _ => "png",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
        let image = RgbaImage::from_pixel(width, height, Rgba(color));
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_decodes_bare_base64_and_sniffs_extension() {
        let png = png_bytes(2, 3, [255, 0, 0, 255]);
        let decoded = decode_image_payload(&BASE64_STANDARD.encode(&png)).unwrap();
        assert_eq!(decoded.ext, "png");
        assert_eq!(decoded.dimensions().unwrap(), (2, 3));
    }

    #[test]
    fn test_data_uri_mime_sets_extension() {
        let png = png_bytes(1, 1, [0, 0, 0, 255]);
        let payload = format!("data:image/webp;base64,{}", BASE64_STANDARD.encode(&png));
        assert_eq!(decode_image_payload(&payload).unwrap().ext, "webp");
    }

    #[test]
    fn test_empty_and_malformed_payloads_fail() {
        assert!(decode_image_payload("  ").is_err());
        assert!(decode_image_payload("data:image/png,abc").is_err());
        assert!(decode_image_payload("!!!not-base64").is_err());
    }
}
