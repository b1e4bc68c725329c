use std::io::Read;
use std::path::Path;

use base64::Engine;
use image::ImageFormat;

use crate::models::attempt::{DispatchFailure, FailureKind};

/// Formats the vision API accepts.
pub const SUPPORTED_FORMATS: [ImageFormat; 3] =
    [ImageFormat::Jpeg, ImageFormat::Png, ImageFormat::WebP];

/// An image ready to be embedded in a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub mime_type: &'static str,
    /// `data:<mime>;base64,<payload>`
    pub data_url: String,
}

/// Supported format of a file, judged by its extension.
pub fn supported_format(path: &Path) -> Option<ImageFormat> {
    ImageFormat::from_path(path)
        .ok()
        .filter(|format| SUPPORTED_FORMATS.contains(format))
}

pub fn is_supported(path: &Path) -> bool {
    supported_format(path).is_some()
}

/// Length of the data URL for a file of `file_len` bytes.
pub fn data_url_len(mime_type: &str, file_len: u64) -> u64 {
    let prefix = "data:".len() + mime_type.len() + ";base64,".len();
    prefix as u64 + file_len.div_ceil(3) * 4
}

/// Bytes read from the start of a file to confirm its format.
const SNIFF_LEN: u64 = 16;

/// Exact encoded size of an image, from metadata and the file's magic bytes.
///
/// Files whose content does not match their extension are rejected here so
/// they never share a batch with readable images.
pub fn estimated_size(path: &Path) -> Result<u64, EncodeError> {
    let format = supported_format(path).ok_or_else(|| EncodeError::Unsupported(path.display().to_string()))?;
    let metadata = std::fs::metadata(path).map_err(|source| EncodeError::Io {
        path: path.display().to_string(),
        source,
    })?;
    if !metadata.is_file() {
        return Err(EncodeError::NotAFile(path.display().to_string()));
    }
    if metadata.len() == 0 {
        return Err(EncodeError::Empty(path.display().to_string()));
    }

    let mut head = Vec::with_capacity(SNIFF_LEN as usize);
    std::fs::File::open(path)
        .and_then(|file| file.take(SNIFF_LEN).read_to_end(&mut head))
        .map_err(|source| EncodeError::Io {
            path: path.display().to_string(),
            source,
        })?;
    check_format(&head, format).map_err(|e| e.for_path(path))?;

    Ok(data_url_len(format.to_mime_type(), metadata.len()))
}

/// Read an image and encode it as a base64 data URL.
pub async fn encode(path: &Path) -> Result<EncodedImage, EncodeError> {
    let format = supported_format(path).ok_or_else(|| EncodeError::Unsupported(path.display().to_string()))?;
    let bytes = tokio::fs::read(path).await.map_err(|source| EncodeError::Io {
        path: path.display().to_string(),
        source,
    })?;
    encode_bytes(&bytes, format).map_err(|e| e.for_path(path))
}

/// Encode raw bytes that claim to be `format`.
pub fn encode_bytes(bytes: &[u8], format: ImageFormat) -> Result<EncodedImage, EncodeError> {
    if bytes.is_empty() {
        return Err(EncodeError::Empty(String::new()));
    }
    check_format(bytes, format)?;

    let mime_type = format.to_mime_type();
    let payload = base64::engine::general_purpose::STANDARD.encode(bytes);
    tracing::debug!(
        mime_type,
        raw_bytes = bytes.len(),
        encoded_bytes = payload.len(),
        "Encoded image"
    );
    Ok(EncodedImage {
        mime_type,
        data_url: format!("data:{mime_type};base64,{payload}"),
    })
}

/// Magic bytes at the start of `bytes` must match `format`.
fn check_format(bytes: &[u8], format: ImageFormat) -> Result<(), EncodeError> {
    match image::guess_format(bytes) {
        Ok(actual) if actual == format => Ok(()),
        Ok(actual) => Err(EncodeError::Mismatch {
            path: String::new(),
            expected: format.to_mime_type(),
            actual: actual.to_mime_type(),
        }),
        Err(_) => Err(EncodeError::Unsupported(String::new())),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("Unsupported image format: {0}")]
    Unsupported(String),

    #[error("Image file is empty: {0}")]
    Empty(String),

    #[error("Not a regular file: {0}")]
    NotAFile(String),

    #[error("Image content of {path} is {actual}, expected {expected}")]
    Mismatch {
        path: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl EncodeError {
    fn for_path(self, path: &Path) -> Self {
        let shown = path.display().to_string();
        match self {
            EncodeError::Unsupported(_) => EncodeError::Unsupported(shown),
            EncodeError::Empty(_) => EncodeError::Empty(shown),
            EncodeError::NotAFile(_) => EncodeError::NotAFile(shown),
            EncodeError::Mismatch {
                expected, actual, ..
            } => EncodeError::Mismatch {
                path: shown,
                expected,
                actual,
            },
            io @ EncodeError::Io { .. } => io,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            EncodeError::Unsupported(_) | EncodeError::Mismatch { .. } => {
                FailureKind::UnsupportedFormat
            }
            EncodeError::Empty(_) | EncodeError::NotAFile(_) | EncodeError::Io { .. } => {
                FailureKind::InvalidRequest
            }
        }
    }
}

impl From<EncodeError> for DispatchFailure {
    fn from(err: EncodeError) -> Self {
        DispatchFailure::new(err.kind(), err.to_string())
    }
}
