//! Incremental cache key derived from the additional flavor configuration
//!
//! The compiler already invalidates its build info when project options
//! change; only the extra flavors are invisible to it, so they pick the
//! cache file name.

use crate::settings::AdditionalModuleKind;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

/// Length of the key kept in the cache file name
const KEY_LENGTH: usize = 8;

/// Short content hash naming the incremental cache file
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IncrementalCacheKey(String);

impl IncrementalCacheKey {
    /// Hash the serialized additional flavor list
    pub fn from_additional_kinds(kinds: &[AdditionalModuleKind]) -> Self {
        let serialized = serde_json::to_string(kinds).unwrap_or_default();
        Self::from_bytes(serialized.as_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut encoded = URL_SAFE_NO_PAD.encode(digest);
        encoded.truncate(KEY_LENGTH);
        Self(encoded)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `<metadata folder>/ts_<key>.json`, always with `/` separators so the
    /// path compares equal to what the compiler serializes into build info
    pub fn build_info_path(&self, metadata_folder: &Path) -> PathBuf {
        let folder = metadata_folder.to_string_lossy().replace('\\', "/");
        let folder = folder.trim_end_matches('/');
        PathBuf::from(format!("{}/ts_{}.json", folder, self.0))
    }
}

impl fmt::Display for IncrementalCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
