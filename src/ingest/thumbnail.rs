use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageError, ImageFormat, ImageReader};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{IngestError, Result};

/// Longest edge of a generated thumbnail, in pixels.
pub const THUMBNAIL_EDGE: u32 = 300;

const THUMB_SUFFIX: &str = "_thumb";

/// `<dir>/<name>_thumb.jpg` for `<dir>/<name>.<ext>`.
pub fn thumbnail_path_for(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}{THUMB_SUFFIX}.jpg"))
}

pub fn is_thumbnail(path: &Path) -> bool {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .is_some_and(|stem| stem.ends_with(THUMB_SUFFIX))
}

/// Scale down so the longest edge is at most `edge`, keeping the aspect ratio.
/// Images already inside the box are returned at their own size.
pub fn fit_long_edge(img: &DynamicImage, edge: u32) -> DynamicImage {
    let (width, height) = img.dimensions();
    if width <= edge && height <= edge {
        return img.clone();
    }
    img.resize(edge, edge, FilterType::Lanczos3)
}

/// Decode an image, sniffing the format from its content rather than its name.
pub fn decode(path: &Path) -> Result<DynamicImage> {
    ImageReader::open(path)
        .map_err(|err| IngestError::storage("open image", path, err))?
        .with_guessed_format()
        .map_err(|err| IngestError::storage("read image", path, err))?
        .decode()
        .map_err(|err| IngestError::unreadable(path, err))
}

/// Write a JPEG thumbnail next to `path` and return its location.
pub fn generate_thumbnail(path: &Path) -> Result<PathBuf> {
    let img = decode(path)?;
    let thumb = fit_long_edge(&img, THUMBNAIL_EDGE);

    let thumb_path = thumbnail_path_for(path);
    // JPEG has no alpha channel
    thumb
        .to_rgb8()
        .save_with_format(&thumb_path, ImageFormat::Jpeg)
        .map_err(|err| match err {
            ImageError::IoError(source) => IngestError::storage("write thumbnail", &thumb_path, source),
            other => IngestError::storage("encode thumbnail", &thumb_path, io::Error::other(other)),
        })?;

    Ok(thumb_path)
}
