//! Image decoding and thumbnail rendering.
//!
//! [`ImageRuntime`] is created once by the entry point and shared with the
//! gallery service. It bounds the number of concurrent decodes, applies
//! decoder limits, and refuses work after [`ImageRuntime::teardown`].
//! Decoding runs on the blocking thread pool.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageReader, Limits};
use model::ThumbSize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::config::ImagingConfig;

/// MIME type of every rendered thumbnail.
pub const THUMBNAIL_CONTENT_TYPE: &str = "image/jpeg";

/// JPEG quality of rendered thumbnails.
pub const THUMBNAIL_QUALITY: u8 = 95;

/// Errors from the image collaborator.
#[derive(Debug, Error)]
pub enum ImagingError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to encode thumbnail of {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("{path} is too large: {width}x{height}")]
    TooLarge { path: PathBuf, width: u32, height: u32 },

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("image runtime is shut down")]
    ShutDown,

    #[error("decode task failed: {0}")]
    Task(String),
}

/// Display dimensions of an image, after applying its orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
}

/// Process-wide imaging state.
pub struct ImageRuntime {
    permits: Arc<Semaphore>,
    limits: Limits,
    max_pixels: u64,
}

impl ImageRuntime {
    pub fn init(config: &ImagingConfig) -> Self {
        let mut limits = Limits::default();
        // Worst case is 16-bit RGBA.
        limits.max_alloc = Some(config.max_image_pixels.saturating_mul(8));

        info!(
            max_concurrent_decodes = config.max_concurrent_decodes,
            max_image_pixels = config.max_image_pixels,
            "Image runtime initialised"
        );

        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_decodes)),
            limits,
            max_pixels: config.max_image_pixels,
        }
    }

    /// Refuse further work. Decodes already running finish normally.
    pub fn teardown(&self) {
        if !self.permits.is_closed() {
            self.permits.close();
            info!("Image runtime torn down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.permits.is_closed()
    }

    /// Read the dimensions of the image at `path`.
    pub async fn describe(&self, path: PathBuf) -> Result<ImageDimensions, ImagingError> {
        let limits = self.limits.clone();
        let max_pixels = self.max_pixels;
        self.run(move || describe_blocking(&path, limits, max_pixels)).await
    }

    /// Render a JPEG thumbnail of the image at `path`.
    pub async fn render_thumbnail(
        &self,
        path: PathBuf,
        size: ThumbSize,
    ) -> Result<Vec<u8>, ImagingError> {
        let limits = self.limits.clone();
        let max_pixels = self.max_pixels;
        self.run(move || render_blocking(&path, size, limits, max_pixels)).await
    }

    async fn run<T, F>(&self, f: F) -> Result<T, ImagingError>
    where
        F: FnOnce() -> Result<T, ImagingError> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ImagingError::ShutDown)?;

        // The permit moves into the task so it is held until decoding ends,
        // even if the caller stops waiting.
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .map_err(|e| ImagingError::Task(e.to_string()))?
    }
}

fn open(path: &Path, limits: Limits) -> Result<ImageReader<BufReader<File>>, ImagingError> {
    let mut reader = ImageReader::open(path)
        .map_err(|e| ImagingError::Open {
            path: path.to_path_buf(),
            source: e,
        })?
        .with_guessed_format()
        .map_err(|e| ImagingError::Open {
            path: path.to_path_buf(),
            source: e,
        })?;
    reader.limits(limits);
    Ok(reader)
}

fn decoder(
    path: &Path,
    reader: ImageReader<BufReader<File>>,
    max_pixels: u64,
) -> Result<impl ImageDecoder, ImagingError> {
    let decoder = reader.into_decoder().map_err(|e| ImagingError::Decode {
        path: path.to_path_buf(),
        source: e,
    })?;

    let (width, height) = decoder.dimensions();
    if u64::from(width) * u64::from(height) > max_pixels {
        return Err(ImagingError::TooLarge {
            path: path.to_path_buf(),
            width,
            height,
        });
    }
    Ok(decoder)
}

/// Whether `orientation` swaps width and height.
fn is_transposed(orientation: Orientation) -> bool {
    matches!(
        orientation,
        Orientation::Rotate90
            | Orientation::Rotate270
            | Orientation::Rotate90FlipH
            | Orientation::Rotate270FlipH
    )
}

fn describe_blocking(path: &Path, limits: Limits, max_pixels: u64) -> Result<ImageDimensions, ImagingError> {
    let mut decoder = decoder(path, open(path, limits)?, max_pixels)?;
    let (width, height) = decoder.dimensions();
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);

    let dimensions = if is_transposed(orientation) {
        ImageDimensions {
            width: height,
            height: width,
        }
    } else {
        ImageDimensions { width, height }
    };
    debug!(path = %path.display(), ?dimensions, ?orientation, "Described image");
    Ok(dimensions)
}

/// Scale `image` so its longer side is at most `max_side`. Never upscales.
fn fit(image: DynamicImage, max_side: u32) -> DynamicImage {
    if image.width().max(image.height()) <= max_side {
        return image;
    }
    image.resize(max_side, max_side, FilterType::Lanczos3)
}

fn render_blocking(
    path: &Path,
    size: ThumbSize,
    limits: Limits,
    max_pixels: u64,
) -> Result<Vec<u8>, ImagingError> {
    let mut decoder = decoder(path, open(path, limits)?, max_pixels)?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let mut image = DynamicImage::from_decoder(decoder).map_err(|e| ImagingError::Decode {
        path: path.to_path_buf(),
        source: e,
    })?;
    image.apply_orientation(orientation);

    let thumbnail = fit(image, size.pixels());

    let mut out = Vec::new();
    DynamicImage::ImageRgb8(thumbnail.to_rgb8())
        .write_with_encoder(JpegEncoder::new_with_quality(&mut out, THUMBNAIL_QUALITY))
        .map_err(|e| ImagingError::Encode {
            path: path.to_path_buf(),
            source: e,
        })?;

    debug!(
        path = %path.display(),
        size = size.name(),
        bytes = out.len(),
        "Rendered thumbnail"
    );
    Ok(out)
}
