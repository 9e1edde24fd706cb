//! Gallery service.
//!
//! Ties the directory lister, the two caches and the image runtime
//! together. Every operation takes an already validated [`RelativePath`];
//! the HTTP layer owns parsing.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use model::{
    CacheKey, Directory, DirectoryListing, Image, Item, Page, RelativePath, ThumbSize,
};
use tracing::{debug, info};

use crate::cache::{Cache, CacheError, CachedContent, Filled, VersionedCache};
use crate::config::PathsConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::imaging::{ImageRuntime, ImagingError, THUMBNAIL_CONTENT_TYPE};
use crate::listing::{DirectoryLister, EntryKind, ListedEntry};

/// Page served for directory requests without an action.
pub const INDEX_PAGE: &str = "index.html";

const METADATA_ARTIFACT: &str = "image metadata";
const THUMBNAIL_ARTIFACT: &str = "thumbnail";

pub struct GalleryService {
    lister: DirectoryLister,
    resource_dir: PathBuf,
    thumbnails: Cache,
    metadata: Cache,
    imaging: Arc<ImageRuntime>,
    fill_timeout: Duration,
}

impl GalleryService {
    pub fn new(
        paths: &PathsConfig,
        thumbnails: Cache,
        metadata: Cache,
        imaging: Arc<ImageRuntime>,
        fill_timeout: Duration,
    ) -> Self {
        info!(
            image_dir = %paths.image_dir.display(),
            resource_dir = %paths.resource_dir.display(),
            thumbnails = thumbnails.kind(),
            metadata = metadata.kind(),
            ?fill_timeout,
            "Gallery service ready"
        );

        Self {
            lister: DirectoryLister::new(&paths.image_dir),
            resource_dir: paths.resource_dir.clone(),
            thumbnails,
            metadata,
            imaging,
            fill_timeout,
        }
    }

    pub fn lister(&self) -> &DirectoryLister {
        &self.lister
    }

    /// A file below the image root. Directories serve the index page so
    /// the frontend can render them.
    pub async fn file(&self, path: &RelativePath) -> ServiceResult<CachedContent> {
        let entry = self.stat(path).await?;
        match entry.kind {
            EntryKind::Directory => self.resource(&RelativePath::new(INDEX_PAGE)?).await,
            EntryKind::File => Ok(served_file(self.lister.resolve(path))),
            EntryKind::Other => Err(ServiceError::NotFound(path.to_string())),
        }
    }

    /// A static frontend asset.
    pub async fn resource(&self, path: &RelativePath) -> ServiceResult<CachedContent> {
        let full = path.to_path(&self.resource_dir);
        let metadata = tokio::fs::metadata(&full)
            .await
            .map_err(|e| ServiceError::from_io(path, e))?;
        if !metadata.is_file() {
            return Err(ServiceError::NotFound(path.to_string()));
        }
        Ok(served_file(full))
    }

    /// One page of a directory, with each image described through the
    /// metadata cache.
    pub async fn directory(
        &self,
        path: &RelativePath,
        page: &Page,
    ) -> ServiceResult<DirectoryListing> {
        let lister = self.lister.clone();
        let dir = path.clone();
        let request = page.clone();
        let slice = tokio::task::spawn_blocking(move || lister.page(&dir, &request)).await??;

        let mut directories = Vec::new();
        let mut images = Vec::new();
        for entry in &slice.entries {
            let child = path.join_name(&entry.name)?;
            if entry.is_image_directory() {
                directories.push(Directory::at(&child));
            } else {
                images.push(self.describe(&child, entry).await?);
            }
        }

        debug!(
            path = %path,
            directories = directories.len(),
            images = images.len(),
            more = slice.next_token.is_some(),
            "Listed directory"
        );

        Ok(DirectoryListing {
            directory: Directory::at(path),
            directories,
            images,
            next_page_token: slice.next_token.map(|token| token.encode()),
        })
    }

    /// Dimensions of a single image.
    pub async fn image_info(&self, path: &RelativePath) -> ServiceResult<Image> {
        let entry = self.stat(path).await?;
        self.describe(path, &entry).await
    }

    /// A JPEG thumbnail of an image, rendered on first request.
    pub async fn thumbnail(
        &self,
        path: &RelativePath,
        size: ThumbSize,
    ) -> ServiceResult<CachedContent> {
        let entry = self.stat(path).await?;
        if !entry.is_image() {
            return Err(ServiceError::NotFound(format!("{} is not an image", path)));
        }

        let key = CacheKey::new(&(THUMBNAIL_ARTIFACT, path.as_str(), size.name()))?;
        let version = entry.version();

        let imaging = Arc::clone(&self.imaging);
        let full = self.lister.resolve(path);
        let timeout = self.fill_timeout;
        let fill_version = version.clone();

        self.thumbnails
            .get_or_fill_handler(
                &key,
                &version,
                move || async move {
                    let bytes = bounded(
                        timeout,
                        THUMBNAIL_ARTIFACT,
                        imaging.render_thumbnail(full, size),
                    )
                    .await?;
                    Ok::<_, ServiceError>(Filled::new(fill_version, bytes))
                },
                THUMBNAIL_CONTENT_TYPE,
            )
            .await
    }

    /// Close both caches. Both are closed even if the first one fails.
    pub async fn close(&self) -> Result<(), CacheError> {
        let thumbnails = self.thumbnails.close().await;
        let metadata = self.metadata.close().await;
        thumbnails?;
        metadata
    }

    async fn stat(&self, path: &RelativePath) -> ServiceResult<ListedEntry> {
        let lister = self.lister.clone();
        let path = path.clone();
        tokio::task::spawn_blocking(move || lister.stat(&path)).await?
    }

    async fn describe(&self, path: &RelativePath, entry: &ListedEntry) -> ServiceResult<Image> {
        if !entry.is_image() {
            return Err(ServiceError::NotFound(format!("{} is not an image", path)));
        }

        let key = CacheKey::new(&("imagemeta", path.as_str()))?;
        let version = entry.version();

        let imaging = Arc::clone(&self.imaging);
        let full = self.lister.resolve(path);
        let item = Item::at(path);
        let timeout = self.fill_timeout;
        let fill_version = version.clone();

        let bytes = self
            .metadata
            .get_or_fill(&key, &version, move || async move {
                let dimensions = bounded(timeout, METADATA_ARTIFACT, imaging.describe(full)).await?;
                let image = Image {
                    item,
                    width: dimensions.width,
                    height: dimensions.height,
                };
                Ok::<_, ServiceError>(Filled::new(fill_version, image.to_json()?))
            })
            .await?;

        Ok(Image::from_json(&bytes)?)
    }
}

fn served_file(path: PathBuf) -> CachedContent {
    let content_type = mime_guess::from_path(&path)
        .first_or_octet_stream()
        .to_string();
    CachedContent::File { path, content_type }
}

/// Run an imaging call under `timeout`. Expiry is a filler error.
async fn bounded<T>(
    timeout: Duration,
    artifact: &'static str,
    work: impl Future<Output = Result<T, ImagingError>>,
) -> ServiceResult<T> {
    match tokio::time::timeout(timeout, work).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(ServiceError::Filler { artifact, source }),
        Err(_) => Err(ServiceError::Filler {
            artifact,
            source: ImagingError::TimedOut(timeout),
        }),
    }
}
