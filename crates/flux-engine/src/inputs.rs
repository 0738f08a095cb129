use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;

use crate::origin::{OriginRejection, OriginValidator, Resolver};

/// A caller-supplied image reference that has passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageReference {
    RemoteUrl(String),
    DataUrl(String),
    LocalFile { path: PathBuf, base64: String },
}

impl ImageReference {
    /// Value sent as `input_image`.
    pub fn payload_value(&self) -> &str {
        match self {
            Self::RemoteUrl(url) | Self::DataUrl(url) => url,
            Self::LocalFile { base64, .. } => base64,
        }
    }

    pub fn source_label(&self) -> String {
        match self {
            Self::RemoteUrl(url) => url.clone(),
            Self::DataUrl(url) => format!("inline data url ({} chars)", url.len()),
            Self::LocalFile { path, .. } => path.display().to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("input image rejected ({}): {}", .0.reason, .0.message)]
    Rejected(#[from] OriginRejection),
    #[error("failed reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl InputError {
    pub fn rejection(&self) -> Option<&OriginRejection> {
        match self {
            Self::Rejected(rejection) => Some(rejection),
            Self::Read { .. } => None,
        }
    }
}

/// Validates `raw` and turns it into something the API accepts.
///
/// `http(s)://` URLs go through the remote origin checks and are forwarded
/// unchanged. `data:image/` URLs pass through. Anything else is a local
/// path: it is sniffed and then base64-encoded.
pub fn resolve_image_reference<R: Resolver>(
    raw: &str,
    validator: &OriginValidator<R>,
) -> Result<ImageReference, InputError> {
    let trimmed = raw.trim();
    let lowered = trimmed.to_ascii_lowercase();
    if lowered.starts_with("http://") || lowered.starts_with("https://") {
        validator.validate_remote_origin(trimmed).into_result()?;
        return Ok(ImageReference::RemoteUrl(trimmed.to_string()));
    }
    if lowered.starts_with("data:image/") {
        return Ok(ImageReference::DataUrl(trimmed.to_string()));
    }
    let path = Path::new(trimmed);
    validator.validate_local_path(path).into_result()?;
    let bytes = fs::read(path).map_err(|source| InputError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(ImageReference::LocalFile {
        path: path.to_path_buf(),
        base64: BASE64.encode(bytes),
    })
}
