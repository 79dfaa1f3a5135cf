//! Failure taxonomy for the download pipeline.
//!
//! Every stage fails with one of these kinds; [`Error::user_message`] is the only
//! place where a kind becomes text shown to the user.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("missing url")]
    MissingUrl,

    #[error("url is not from a supported source: {url}")]
    UnsupportedSource { url: String, supported: String },

    #[error("malformed url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("failed to create workspace: {0}")]
    ResourceAllocation(#[source] io::Error),

    #[error("{0}")]
    Extraction(String),

    #[error("engine reported success but no artifact exists at {}", .0.display())]
    ArtifactMissing(PathBuf),

    #[error("artifact at {} is empty", .0.display())]
    EmptyArtifact(PathBuf),

    #[error("stream to client failed: {0}")]
    Stream(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Text shown to the user for this failure.
    pub fn user_message(&self) -> String {
        match self {
            Error::MissingUrl => "Please enter a valid video link.".to_string(),
            Error::UnsupportedSource { supported, .. } => {
                format!("Only {} links are supported at the moment, please try again.", supported)
            }
            Error::InvalidUrl { .. } => "That does not look like a valid link, please check it.".to_string(),
            Error::ResourceAllocation(_) => "Could not prepare the download, please try again later.".to_string(),
            Error::Extraction(cause) => format!("Download failed: {}", cause),
            Error::ArtifactMissing(_) | Error::EmptyArtifact(_) => {
                "Download failed: the downloaded file could not be found, please try again later.".to_string()
            }
            Error::Stream(_) => "Download interrupted.".to_string(),
        }
    }

    /// True when the engine broke its contract (claimed success without a usable file).
    pub fn is_integrity_anomaly(&self) -> bool {
        matches!(self, Error::ArtifactMissing(_) | Error::EmptyArtifact(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::MissingUrl | Error::UnsupportedSource { .. } | Error::InvalidUrl { .. }
        )
    }
}
