//! Thumbnail size buckets.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// One of the fixed thumbnail sizes, measured along the longer side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ThumbSize {
    Px100,
    Px240,
    Px360,
    Px500,
    Px800,
    Px1024,
    Px1600,
    Px2048,
}

impl ThumbSize {
    /// Every bucket, smallest first.
    pub const ALL: [ThumbSize; 8] = [
        ThumbSize::Px100,
        ThumbSize::Px240,
        ThumbSize::Px360,
        ThumbSize::Px500,
        ThumbSize::Px800,
        ThumbSize::Px1024,
        ThumbSize::Px1600,
        ThumbSize::Px2048,
    ];

    /// Bucket used when the client does not ask for one.
    pub const DEFAULT: ThumbSize = ThumbSize::Px800;

    /// Parse a `size` query parameter. The empty string selects the default.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(Self::DEFAULT);
        }
        Self::ALL
            .into_iter()
            .find(|size| size.name() == s)
            .ok_or_else(|| ModelError::UnknownThumbSize(s.to_string()))
    }

    /// Canonical name, also used in cache keys.
    pub fn name(&self) -> &'static str {
        match self {
            ThumbSize::Px100 => "100",
            ThumbSize::Px240 => "240",
            ThumbSize::Px360 => "360",
            ThumbSize::Px500 => "500",
            ThumbSize::Px800 => "800",
            ThumbSize::Px1024 => "1024",
            ThumbSize::Px1600 => "1600",
            ThumbSize::Px2048 => "2048",
        }
    }

    pub fn pixels(&self) -> u32 {
        match self {
            ThumbSize::Px100 => 100,
            ThumbSize::Px240 => 240,
            ThumbSize::Px360 => 360,
            ThumbSize::Px500 => 500,
            ThumbSize::Px800 => 800,
            ThumbSize::Px1024 => 1024,
            ThumbSize::Px1600 => 1600,
            ThumbSize::Px2048 => 2048,
        }
    }
}

impl Default for ThumbSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for ThumbSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<String> for ThumbSize {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self> {
        ThumbSize::parse(&value)
    }
}

impl From<ThumbSize> for String {
    fn from(size: ThumbSize) -> Self {
        size.name().to_string()
    }
}
