//! Listing and metadata models returned to clients.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::safe::RelativePath;

/// Common fields of everything that appears in a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub name: String,
    pub relative_path: RelativePath,
}

impl Item {
    /// Item for `path`, named after its last component.
    pub fn at(path: &RelativePath) -> Self {
        Self {
            name: path.file_name().to_string(),
            relative_path: path.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    #[serde(flatten)]
    pub item: Item,
}

impl Directory {
    pub fn at(path: &RelativePath) -> Self {
        Self {
            item: Item::at(path),
        }
    }
}

/// An image together with its display dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    #[serde(flatten)]
    pub item: Item,
    pub width: u32,
    pub height: u32,
}

impl Image {
    /// Encode for storage in the metadata cache.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// One page of a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryListing {
    #[serde(flatten)]
    pub directory: Directory,
    pub directories: Vec<Directory>,
    pub images: Vec<Image>,
    /// Opaque token for the next page, `null` on the last page.
    pub next_page_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(s: &str) -> RelativePath {
        RelativePath::new(s).unwrap()
    }

    #[test]
    fn test_item_at() {
        let item = Item::at(&path("album/cat.jpg"));
        assert_eq!(item.name, "cat.jpg");
        assert_eq!(item.relative_path.as_str(), "album/cat.jpg");

        let root = Item::at(&RelativePath::root());
        assert_eq!(root.name, "");
    }

    #[test]
    fn test_image_json_shape() {
        let image = Image {
            item: Item::at(&path("a/b.png")),
            width: 640,
            height: 480,
        };
        let value = serde_json::to_value(&image).unwrap();
        assert_eq!(
            value,
            json!({
                "name": "b.png",
                "relative_path": "a/b.png",
                "width": 640,
                "height": 480,
            })
        );
        assert_eq!(Image::from_json(&image.to_json().unwrap()).unwrap(), image);
    }

    #[test]
    fn test_listing_json_shape() {
        let listing = DirectoryListing {
            directory: Directory::at(&path("a")),
            directories: vec![Directory::at(&path("a/sub"))],
            images: vec![],
            next_page_token: None,
        };
        let value = serde_json::to_value(&listing).unwrap();
        assert_eq!(
            value,
            json!({
                "name": "a",
                "relative_path": "a",
                "directories": [{"name": "sub", "relative_path": "a/sub"}],
                "images": [],
                "next_page_token": null,
            })
        );
    }

    #[test]
    fn test_cached_image_with_unsafe_path_is_rejected() {
        let raw = br#"{"name":"x","relative_path":"../x","width":1,"height":1}"#;
        assert!(Image::from_json(raw).is_err());
    }
}
