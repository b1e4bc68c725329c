use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::batch::Payload;

/// Review state of an image in the manifest.
///
/// Serialized as `pending`, `approved`, `rejected` or `retry_<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    /// Last run ended in a terminal failure; `n` is the retry count at that point.
    Retry(u32),
}

impl ImageStatus {
    /// Whether a run may send this image to the vision API.
    pub fn is_dispatchable(self, regenerate_rejected: bool) -> bool {
        match self {
            ImageStatus::Pending | ImageStatus::Retry(_) => true,
            ImageStatus::Rejected => regenerate_rejected,
            ImageStatus::Approved => false,
        }
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageStatus::Pending => f.write_str("pending"),
            ImageStatus::Approved => f.write_str("approved"),
            ImageStatus::Rejected => f.write_str("rejected"),
            ImageStatus::Retry(n) => write!(f, "retry_{n}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown image status: {0:?}")]
pub struct ParseStatusError(String);

impl FromStr for ImageStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "pending" => Ok(ImageStatus::Pending),
            "approved" => Ok(ImageStatus::Approved),
            "rejected" => Ok(ImageStatus::Rejected),
            other => other
                .strip_prefix("retry_")
                .and_then(|n| n.parse().ok())
                .map(ImageStatus::Retry)
                .ok_or_else(|| ParseStatusError(other.to_string())),
        }
    }
}

impl Serialize for ImageStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ImageStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One manifest row: the durable state of a single image across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Path relative to the manifest's directory, `/`-separated.
    pub filepath: String,
    #[serde(default)]
    pub prompt_en: String,
    #[serde(default)]
    pub prompt_cn: String,
    #[serde(default)]
    pub status: ImageStatus,
    #[serde(default)]
    pub retry_cnt: u32,
}

impl ImageRecord {
    pub fn new(filepath: impl Into<String>) -> Self {
        Self {
            filepath: filepath.into(),
            prompt_en: String::new(),
            prompt_cn: String::new(),
            status: ImageStatus::Pending,
            retry_cnt: 0,
        }
    }

    pub fn has_caption(&self) -> bool {
        !self.prompt_en.trim().is_empty()
    }
}

/// An image selected for this run, with its planned payload size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUnit {
    /// Manifest key of the image.
    pub filepath: String,
    /// Absolute (or working-directory relative) location on disk.
    pub source: PathBuf,
    /// Size of the base64 data URL that will carry the image.
    pub encoded_size: u64,
}

impl Payload for ImageUnit {
    fn encoded_size(&self) -> u64 {
        self.encoded_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            ImageStatus::Pending,
            ImageStatus::Approved,
            ImageStatus::Rejected,
            ImageStatus::Retry(4),
        ] {
            assert_eq!(status.to_string().parse::<ImageStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_blank_status_means_pending() {
        assert_eq!("".parse::<ImageStatus>().unwrap(), ImageStatus::Pending);
    }

    #[test]
    fn test_garbage_status_rejected() {
        assert!("retry_x".parse::<ImageStatus>().is_err());
        assert!("done".parse::<ImageStatus>().is_err());
    }

    #[test]
    fn test_dispatchable_statuses() {
        assert!(ImageStatus::Pending.is_dispatchable(false));
        assert!(ImageStatus::Retry(2).is_dispatchable(false));
        assert!(!ImageStatus::Approved.is_dispatchable(true));
        assert!(!ImageStatus::Rejected.is_dispatchable(false));
        assert!(ImageStatus::Rejected.is_dispatchable(true));
    }
}
