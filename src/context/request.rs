//! Immutable request descriptors and the cache keys derived from them.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How deep into the pipeline a request may go.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RequestLevel {
    #[default]
    FullFetch = 1,
    DiskCache = 2,
    EncodedMemoryCache = 3,
    BitmapMemoryCache = 4,
}

impl RequestLevel {
    /// The more restrictive of two levels.
    pub fn more_restrictive(a: Self, b: Self) -> Self {
        a.max(b)
    }
}

/// Target dimensions for a decoded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResizeOptions {
    pub width: u32,
    pub height: u32,
}

/// A source locator plus processing options.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRequest {
    pub source: String,
    pub resize_options: Option<ResizeOptions>,
    pub lowest_permitted_request_level: RequestLevel,
    pub progressive_rendering_enabled: bool,
}

impl ImageRequest {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            resize_options: None,
            lowest_permitted_request_level: RequestLevel::FullFetch,
            progressive_rendering_enabled: false,
        }
    }

    pub fn with_resize(mut self, width: u32, height: u32) -> Self {
        self.resize_options = Some(ResizeOptions { width, height });
        self
    }

    pub fn with_lowest_permitted_request_level(mut self, level: RequestLevel) -> Self {
        self.lowest_permitted_request_level = level;
        self
    }

    pub fn with_progressive_rendering(mut self, enabled: bool) -> Self {
        self.progressive_rendering_enabled = enabled;
        self
    }
}

/// SHA-256 identity of a request at some pipeline stage.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// Key of the decoded image: source plus resize options.
    pub fn bitmap(request: &ImageRequest) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"bitmap:");
        hasher.update(request.source.as_bytes());
        if let Some(resize) = request.resize_options {
            hasher.update(resize.width.to_le_bytes());
            hasher.update(resize.height.to_le_bytes());
        }
        Self(hasher.finalize().into())
    }

    /// Key of the encoded bytes: source only.
    pub fn encoded(request: &ImageRequest) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"encoded:");
        hasher.update(request.source.as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", &self.to_hex()[..12])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_key_depends_on_resize() {
        let plain = ImageRequest::new("https://img/1.jpg");
        let resized = plain.clone().with_resize(100, 100);
        assert_ne!(CacheKey::bitmap(&plain), CacheKey::bitmap(&resized));
        assert_eq!(CacheKey::bitmap(&resized), CacheKey::bitmap(&resized.clone()));
    }

    #[test]
    fn encoded_key_ignores_resize() {
        let plain = ImageRequest::new("https://img/1.jpg");
        let resized = plain.clone().with_resize(100, 100);
        assert_eq!(CacheKey::encoded(&plain), CacheKey::encoded(&resized));
        assert_ne!(CacheKey::encoded(&plain), CacheKey::bitmap(&plain));
    }

    #[test]
    fn hex_form_is_64_chars() {
        let key = CacheKey::encoded(&ImageRequest::new("a"));
        assert_eq!(key.to_hex().len(), 64);
        assert_eq!(key.to_string(), key.to_hex());
    }

    #[test]
    fn request_level_max_is_most_restrictive() {
        assert_eq!(
            RequestLevel::more_restrictive(RequestLevel::FullFetch, RequestLevel::DiskCache),
            RequestLevel::DiskCache
        );
    }

    #[test]
    fn request_round_trips_through_json() {
        let request = ImageRequest::new("file:///tmp/a.png")
            .with_resize(32, 16)
            .with_lowest_permitted_request_level(RequestLevel::DiskCache);
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"disk_cache\""));
        let back: ImageRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);
    }
}
