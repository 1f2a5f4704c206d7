use base64::Engine;

use crate::error::AppError;

/// Extensions recognised as images when building an index from a listing.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp"];

pub fn get_extension_from_mime_type(mime_type: &str) -> Option<&'static str> {
    match mime_type.to_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "image/bmp" => Some("bmp"),
        _ => None,
    }
}

pub fn get_mime_type_from_extension(ext: &str) -> Option<&'static str> {
    match ext.to_lowercase().as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}

pub fn detect_mime_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("image/png");
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if bytes.starts_with(b"BM") {
        return Some("image/bmp");
    }
    None
}

pub fn extension_from_filename(file_name: &str) -> Option<String> {
    if let Some((stem, ext)) = file_name.rsplit_once('.') {
        let trimmed = ext.trim();
        if !trimmed.is_empty() && !stem.is_empty() {
            return Some(trimmed.to_lowercase());
        }
    }
    None
}

/// Non-hidden file name with one of [`IMAGE_EXTENSIONS`], case-insensitive.
pub fn is_listable_image(file_name: &str) -> bool {
    if file_name.starts_with('.') {
        return false;
    }
    extension_from_filename(file_name)
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Decodes `data:image/<subtype>;base64,<payload>` into its MIME type and bytes.
pub fn decode_data_url(data_url: &str) -> Result<(&'static str, Vec<u8>), AppError> {
    let rest = data_url
        .strip_prefix("data:image/")
        .ok_or_else(|| AppError::invalid_input("invalid image format: expected a data:image/ URL"))?;
    let (subtype, payload) = rest
        .split_once(";base64,")
        .ok_or_else(|| AppError::invalid_input("invalid base64 image data"))?;
    if subtype.is_empty() || !subtype.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(AppError::invalid_input("invalid base64 image data"));
    }
    let mime_type = get_mime_type_from_extension(subtype)
        .ok_or_else(|| AppError::invalid_input(format!("unsupported image type: image/{subtype}")))?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|err| AppError::invalid_input(format!("invalid base64 image data: {err}")))?;
    Ok((mime_type, bytes))
}

/// Picks the MIME type of a multipart upload: the declared content type when it
/// is an image, then magic bytes, then the filename extension.
pub fn resolve_upload_mime_type(
    file_name: &str,
    content_type: Option<&str>,
    bytes: &[u8],
) -> Result<&'static str, AppError> {
    if let Some(content_type) = content_type {
        let essence = content_type.split(';').next().unwrap_or(content_type).trim();
        if let Some(ext) = get_extension_from_mime_type(essence) {
            return get_mime_type_from_extension(ext)
                .ok_or_else(|| AppError::invalid_input("unsupported file type"));
        }
        if essence.starts_with("image/") {
            return Err(AppError::invalid_input(format!("unsupported image type: {essence}")));
        }
        if essence != "application/octet-stream" {
            return Err(AppError::invalid_input("unsupported file type"));
        }
    }
    if let Some(mime) = detect_mime_type(bytes) {
        return Ok(mime);
    }
    extension_from_filename(file_name)
        .and_then(|ext| get_mime_type_from_extension(&ext))
        .ok_or_else(|| AppError::invalid_input("unsupported file type"))
}
