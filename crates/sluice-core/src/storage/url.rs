//! URL parsing for storage backends.

use object_store::path::Path;
use regex::Regex;
use std::sync::LazyLock;

use crate::error::{InvalidUrlSnafu, StorageError};

const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const MEMORY_URL: &str = r"^memory://(?P<key>.*)$";
const FILE_URI: &str = r"^file://(?P<path>.+)$";
const FILE_PATH: &str = r"^(?P<path>/.*)$";

static S3: LazyLock<Regex> = LazyLock::new(|| Regex::new(S3_URL).expect("valid S3 pattern"));
static MEMORY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(MEMORY_URL).expect("valid memory pattern"));
static FILE: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(FILE_URI).expect("valid file uri pattern"),
        Regex::new(FILE_PATH).expect("valid file path pattern"),
    ]
});

/// Backend selected by a storage URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    /// `s3://bucket/prefix`
    S3 { bucket: String, key: Option<Path> },
    /// `memory://prefix`, process-local and lost on exit.
    Memory { key: Option<Path> },
    /// `file:///abs/dir` or `/abs/dir`
    Local { path: String },
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        if let Some(caps) = S3.captures(url) {
            return Ok(BackendConfig::S3 {
                bucket: caps["bucket"].to_string(),
                key: non_empty_key(caps.name("key").map(|m| m.as_str())),
            });
        }

        if let Some(caps) = MEMORY.captures(url) {
            return Ok(BackendConfig::Memory {
                key: non_empty_key(caps.name("key").map(|m| m.as_str())),
            });
        }

        if let Some(caps) = FILE.iter().find_map(|r| r.captures(url)) {
            return Ok(BackendConfig::Local {
                path: caps["path"].to_string(),
            });
        }

        InvalidUrlSnafu {
            url: url.to_string(),
        }
        .fail()
    }

    /// The key prefix prepended to every path, if any.
    pub fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3 { key, .. } | BackendConfig::Memory { key } => key.as_ref(),
            BackendConfig::Local { .. } => None,
        }
    }
}

fn non_empty_key(raw: Option<&str>) -> Option<Path> {
    raw.map(|k| k.trim_matches('/'))
        .filter(|k| !k.is_empty())
        .map(Path::from)
}
