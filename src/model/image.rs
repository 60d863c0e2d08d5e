//! Image loading: file on disk → validated, base64-encoded [`ImageData`].
//!
//! Every backend receives images the same way, as base64 payloads embedded in
//! the JSON request body, so loading happens once in
//! [`crate::model::VisionModel::describe_image`] before any network I/O.
//!
//! Files are decoded locally, so a truncated or mislabelled file fails as
//! [`VisionError::InvalidImage`] without a network round-trip. Decoding and
//! downscaling run on the blocking pool.

use crate::error::VisionError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{DynamicImage, GenericImageView, ImageFormat};
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

/// Longest edge sent to a backend. Larger images are downscaled first.
///
pub const MAX_IMAGE_EDGE: u32 = 2048;

/// A decoded, size-capped image ready to embed in a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    /// Base64 (standard alphabet, padded) of the image bytes.
    pub data: String,
    /// "image/png" or "image/jpeg".
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
}

impl ImageData {
    /// `data:<mime>;base64,<data>` form used by the OpenAI API.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

/// Load `path`, verify it is a decodable image, and encode it.
///
/// # Errors
/// * [`VisionError::FileNotFound`]: the path does not exist or is not a
///   regular file.
/// * [`VisionError::InvalidImage`]: the file cannot be read or decoded.
pub async fn load_image(path: &Path) -> Result<ImageData, VisionError> {
    let not_found = || VisionError::FileNotFound {
        path: path.to_path_buf(),
    };

    let meta = tokio::fs::metadata(path).await.map_err(|_| not_found())?;
    if !meta.is_file() {
        return Err(not_found());
    }

    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| VisionError::InvalidImage {
            path: path.to_path_buf(),
            detail: format!("unreadable: {e}"),
        })?;

    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || encode_bytes(&bytes, MAX_IMAGE_EDGE))
        .await
        .map_err(|e| VisionError::Internal(format!("Image decode task panicked: {e}")))?
        .map_err(|detail| VisionError::InvalidImage {
            path: owned,
            detail,
        })
}

/// Decode `bytes`, downscale past `max_edge`, and base64-encode.
///
/// PNG and JPEG within the size cap are passed through untouched; anything
/// downscaled is re-encoded as PNG.
fn encode_bytes(bytes: &[u8], max_edge: u32) -> Result<ImageData, String> {
    let format = image::guess_format(bytes).map_err(|e| format!("unrecognised format: {e}"))?;
    let img = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| format!("decode failed: {e}"))?;
    let (width, height) = img.dimensions();

    if width.max(height) <= max_edge {
        let mime_type = match format {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            _ => return encode_png(&img),
        };
        return Ok(ImageData {
            data: STANDARD.encode(bytes),
            mime_type: mime_type.to_string(),
            width,
            height,
        });
    }

    debug!(
        "Downscaling {}x{} image to fit {} px",
        width, height, max_edge
    );
    let resized = img.resize(max_edge, max_edge, image::imageops::FilterType::Triangle);
    encode_png(&resized)
}

/// Encode a decoded image as base64 PNG.
pub fn encode_png(img: &DynamicImage) -> Result<ImageData, String> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| format!("PNG encode failed: {e}"))?;

    let data = STANDARD.encode(&buf);
    debug!("Encoded image → {} bytes base64", data.len());

    Ok(ImageData {
        data,
        mime_type: "image/png".to_string(),
        width: img.width(),
        height: img.height(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn write_png(dir: &Path, name: &str, w: u32, h: u32) -> std::path::PathBuf {
        let path = dir.join(name);
        RgbImage::from_pixel(w, h, Rgb([200, 10, 10]))
            .save(&path)
            .expect("write fixture");
        path
    }

    #[tokio::test]
    async fn loads_small_png_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "page_1.png", 12, 8);
        let data = load_image(&path).await.expect("load");
        assert_eq!(data.mime_type, "image/png");
        assert_eq!((data.width, data.height), (12, 8));
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(decoded, std::fs::read(&path).unwrap());
        assert!(data.data_url().starts_with("data:image/png;base64,"));
    }

    #[tokio::test]
    async fn jpeg_keeps_its_mime_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.jpg");
        RgbImage::from_pixel(16, 16, Rgb([0, 0, 0])).save(&path).unwrap();
        let data = load_image(&path).await.unwrap();
        assert_eq!(data.mime_type, "image/jpeg");
    }

    #[tokio::test]
    async fn missing_file_is_file_not_found() {
        let err = load_image(Path::new("/definitely/not/here.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, VisionError::FileNotFound { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn directory_is_file_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_image(dir.path()).await.unwrap_err();
        assert!(matches!(err, VisionError::FileNotFound { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn garbage_bytes_are_invalid_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_an_image.png");
        std::fs::write(&path, b"this is plain text, not a PNG").unwrap();
        let err = load_image(&path).await.unwrap_err();
        assert!(matches!(err, VisionError::InvalidImage { .. }), "got {err:?}");
    }

    #[test]
    fn oversized_image_is_downscaled_to_png() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(400, 100, Rgb([1, 2, 3])));
        let mut jpeg = Vec::new();
        img.write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
            .unwrap();
        let data = encode_bytes(&jpeg, 200).unwrap();
        assert_eq!(data.mime_type, "image/png");
        assert_eq!(data.width, 200);
        assert_eq!(data.height, 50);
    }
}
