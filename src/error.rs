use std::path::PathBuf;
use thiserror::Error;

use crate::progress::TransferDestination;

/// Errors that can occur when probing a volume for capacity
#[derive(Error, Debug)]
pub enum CapacityError {
    #[error("Path is not on a mounted volume: {0}")]
    PathUnavailable(PathBuf),
}

/// Errors that can occur during episode downloads
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Invalid episode URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("HTTP request failed for {url}: {source}")]
    HttpFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Stream error while downloading {url}: {source}")]
    StreamFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to create file {path}: {source}")]
    FileCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write to file {path}: {source}")]
    FileWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Download cancelled")]
    Cancelled,
}

/// Errors that can occur while copying an episode onto a device
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Source file is missing or unreadable: {0}")]
    SourceMissing(PathBuf),

    #[error("Insufficient space on device: need {needed} bytes, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error("Failed to create directory {path} on device: {source}")]
    CreateDirFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Write to device failed at {path}: {source}")]
    DeviceWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Device was removed during transfer (mount {0} is gone)")]
    DeviceRemoved(PathBuf),

    #[error("File not found on device: {0}")]
    NotOnDevice(PathBuf),

    #[error("Transfer cancelled")]
    Cancelled,
}

/// Errors surfaced by the persistence layer
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Episode not found: {0}")]
    NotFound(i64),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// A second operation was requested while one is still running for the
/// same (episode, destination) key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Operation already in progress for episode {episode_id} -> {destination}")]
pub struct AlreadyInProgress {
    pub episode_id: i64,
    pub destination: TransferDestination,
}

/// Top-level errors for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    AlreadyInProgress(#[from] AlreadyInProgress),

    #[error("Episode {0} has no completed download")]
    NotDownloaded(i64),

    #[error("Episode {episode_id}: {source}")]
    Download {
        episode_id: i64,
        #[source]
        source: DownloadError,
    },

    #[error("Episode {episode_id} -> device {device_id}: {source}")]
    Transfer {
        episode_id: i64,
        device_id: String,
        #[source]
        source: TransferError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
