//! Cursor pagination over directory listings.
//!
//! Entries are ordered directories first, then by name. A [`PageToken`]
//! names the last entry of the previous page and acts as an exclusive lower
//! bound for the next one, so pages stay stable while entries are appended
//! elsewhere in the directory.

use std::cmp::Ordering;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Largest page a client may request.
pub const MAX_PAGE_SIZE: usize = 100;

/// Page size used when none (or a non-positive one) is requested.
pub const DEFAULT_PAGE_SIZE: usize = 25;

/// Anything that can be placed in the listing order.
pub trait ListingOrder {
    fn name(&self) -> &str;
    fn is_directory(&self) -> bool;
}

/// Total listing order: directories before files, then by name.
pub fn compare<A: ListingOrder + ?Sized, B: ListingOrder + ?Sized>(a: &A, b: &B) -> Ordering {
    b.is_directory()
        .cmp(&a.is_directory())
        .then_with(|| a.name().cmp(b.name()))
}

/// Position in a listing. Clients treat the encoded form as opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageToken {
    pub name: String,
    pub is_directory: bool,
}

/// Wire form of a token before base64.
#[derive(Serialize, Deserialize)]
struct RawPageToken {
    #[serde(rename = "n")]
    name: String,
    #[serde(rename = "d")]
    is_directory: bool,
}

impl PageToken {
    pub fn new(name: impl Into<String>, is_directory: bool) -> Self {
        Self {
            name: name.into(),
            is_directory,
        }
    }

    /// Token anchored at `entry`.
    pub fn after<T: ListingOrder + ?Sized>(entry: &T) -> Self {
        Self::new(entry.name(), entry.is_directory())
    }

    /// Encode as URL-safe base64 of a compact JSON object.
    pub fn encode(&self) -> String {
        let raw = RawPageToken {
            name: self.name.clone(),
            is_directory: self.is_directory,
        };
        // Serializing a string and a bool into JSON cannot fail.
        let json = serde_json::to_vec(&raw).unwrap_or_default();
        URL_SAFE.encode(json)
    }

    /// Decode a token produced by [`PageToken::encode`].
    ///
    /// The empty string is the start of the listing and decodes to `None`.
    pub fn decode(encoded: &str) -> Result<Option<PageToken>> {
        if encoded.is_empty() {
            return Ok(None);
        }

        let json = URL_SAFE
            .decode(encoded)
            .map_err(|e| ModelError::InvalidPageToken(e.to_string()))?;
        let raw: RawPageToken = serde_json::from_slice(&json)
            .map_err(|e| ModelError::InvalidPageToken(e.to_string()))?;

        Ok(Some(PageToken {
            name: raw.name,
            is_directory: raw.is_directory,
        }))
    }

    /// Whether `entry` sorts strictly after this token.
    pub fn is_before<T: ListingOrder + ?Sized>(&self, entry: &T) -> bool {
        compare(self, entry) == Ordering::Less
    }
}

impl ListingOrder for PageToken {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_directory(&self) -> bool {
        self.is_directory
    }
}

/// Page request parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub token: Option<PageToken>,
    pub size: usize,
}

impl Page {
    /// Build a page request, clamping the size to `1..=MAX_PAGE_SIZE`.
    ///
    /// Absent, zero or negative sizes fall back to [`DEFAULT_PAGE_SIZE`].
    pub fn new(token: Option<PageToken>, size: Option<i64>) -> Self {
        let size = match size {
            Some(n) if n > MAX_PAGE_SIZE as i64 => MAX_PAGE_SIZE,
            Some(n) if n > 0 => n as usize,
            _ => DEFAULT_PAGE_SIZE,
        };
        Self { token, size }
    }

    /// Parse the raw `page_token` and `page_size` query parameters.
    pub fn parse(token: &str, size: Option<&str>) -> Result<Self> {
        let token = PageToken::decode(token)?;
        let size = match size.map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                raw.parse::<i64>()
                    .map_err(|_| ModelError::InvalidPageSize(raw.to_string()))?,
            ),
        };
        Ok(Self::new(token, size))
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSlice<T> {
    pub entries: Vec<T>,
    /// Anchor for the next page; `None` once the listing is complete.
    pub next_token: Option<PageToken>,
}

/// Cut one page out of `sorted`.
///
/// `sorted` must already be in [`compare`] order. Entries rejected by
/// `retain` are skipped and do not count towards the page size.
pub fn paginate<T, F>(sorted: &[T], page: &Page, mut retain: F) -> PageSlice<T>
where
    T: ListingOrder + Clone,
    F: FnMut(&T) -> bool,
{
    let start = match &page.token {
        Some(token) => sorted.partition_point(|entry| !token.is_before(entry)),
        None => 0,
    };

    let mut entries = Vec::with_capacity(page.size.min(sorted.len() - start));
    let mut more = false;

    for entry in sorted[start..].iter().filter(|e| retain(*e)) {
        if entries.len() == page.size {
            more = true;
            break;
        }
        entries.push(entry.clone());
    }

    let next_token = if more {
        entries.last().map(PageToken::after)
    } else {
        None
    };

    PageSlice {
        entries,
        next_token,
    }
}
