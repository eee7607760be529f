//! File type validation using magic number detection.
//!
//! Content types are determined solely by file signatures (via the `infer`
//! crate), never by declared extensions; a declared content type is checked
//! against what the bytes actually are.

use crate::error::{Result, TieredFileError};
use infer::Infer;
use std::collections::HashSet;

/// Information about a detected file type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTypeInfo {
    /// Detected MIME type.
    pub mime_type: String,
    /// Canonical extension for the detected type (without the dot).
    pub extension: String,
}

/// Magic-number based validator restricted to an allow-list of MIME types.
/// An empty allow-list accepts any recognizable type.
pub struct FileTypeValidator {
    allowed_mime_types: HashSet<String>,
    infer: Infer,
}

impl FileTypeValidator {
    /// Validator accepting any type `infer` can recognize.
    pub fn new() -> Self {
        Self::with_allowed(std::iter::empty::<String>())
    }

    /// Validator restricted to the given MIME types.
    pub fn with_allowed<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_mime_types: allowed.into_iter().map(Into::into).collect(),
            infer: Infer::new(),
        }
    }

    /// Validator for the still-image formats the pipeline accepts.
    pub fn images() -> Self {
        Self::with_allowed(["image/jpeg", "image/png", "image/webp"])
    }

    /// Validator for the audio formats the pipeline accepts.
    pub fn audio() -> Self {
        Self::with_allowed(["audio/x-wav", "audio/mpeg", "audio/m4a", "audio/ogg"])
    }

    /// Detect the content type of `bytes` and check it against the allow-list.
    ///
    /// # Errors
    /// Returns `ContentRejected` if the signature is unknown or the detected
    /// type is not allowed.
    pub fn validate_bytes(&self, bytes: &[u8]) -> Result<FileTypeInfo> {
        let Some(detected) = self.infer.get(bytes) else {
            return Err(TieredFileError::ContentRejected {
                detected: "unknown".to_string(),
            });
        };

        let mime_type = detected.mime_type();
        if !self.is_mime_type_allowed(mime_type) {
            return Err(TieredFileError::ContentRejected {
                detected: mime_type.to_string(),
            });
        }

        Ok(FileTypeInfo {
            mime_type: mime_type.to_string(),
            extension: detected.extension().to_string(),
        })
    }

    /// Check whether a MIME type is allowed (empty set allows all).
    pub fn is_mime_type_allowed(&self, mime_type: &str) -> bool {
        self.allowed_mime_types.is_empty() || self.allowed_mime_types.contains(mime_type)
    }
}

impl Default for FileTypeValidator {
    fn default() -> Self {
        Self::new()
    }
}
