// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::error::DownloadError;
use crate::http::HttpClient;
use crate::progress::{FailureCause, ProgressTable, TransferDestination};

/// Suffix for in-flight files, renamed away on success
const PARTIAL_SUFFIX: &str = ".partial";

/// What the engine needs to know to fetch one episode.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub episode_id: i64,
    pub source_url: String,
    /// Podcast-scoped directory the file lands in
    pub destination_dir: PathBuf,
    /// Deterministic filename resolved by the caller
    pub filename: String,
}

/// Result of a successful download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub local_path: PathBuf,
    pub bytes_downloaded: u64,
    /// False when the file was already present and no network I/O happened
    pub fetched: bool,
}

/// Stream an episode's media file to local disk.
///
/// The operation must already be admitted to `table` under
/// `(episode_id, Local)`; this function drives that entry from `Pending`
/// through to its terminal state. A file already present at the resolved
/// path short-circuits with no network I/O. Any failure or cancellation
/// removes the partial file and leaves the entry `Failed` with the
/// classified cause.
pub async fn download_episode<C: HttpClient>(
    client: &C,
    request: &DownloadRequest,
    table: &ProgressTable,
) -> Result<DownloadOutcome, DownloadError> {
    let destination = TransferDestination::Local;
    let episode_id = request.episode_id;
    let final_path = request.destination_dir.join(&request.filename);

    // Repeated requests for a downloaded episode must not re-fetch
    if let Ok(meta) = tokio::fs::metadata(&final_path).await {
        log::info!(
            "episode {}: already present at {}, skipping fetch",
            episode_id,
            final_path.display()
        );
        table.complete_existing(episode_id, &destination, meta.len());
        return Ok(DownloadOutcome {
            local_path: final_path,
            bytes_downloaded: 0,
            fetched: false,
        });
    }

    if let Err(reason) = validate_media_url(&request.source_url) {
        table.fail(episode_id, &destination, FailureCause::InvalidUrl);
        return Err(DownloadError::InvalidUrl {
            url: request.source_url.clone(),
            reason,
        });
    }

    let response = match client.get_stream(&request.source_url).await {
        Ok(response) => response,
        Err(e) => {
            table.fail(episode_id, &destination, FailureCause::Network);
            return Err(DownloadError::HttpFailed {
                url: request.source_url.clone(),
                source: e,
            });
        }
    };

    if !(200..300).contains(&response.status) {
        table.fail(
            episode_id,
            &destination,
            FailureCause::Http {
                status: response.status,
            },
        );
        return Err(DownloadError::HttpStatus {
            url: request.source_url.clone(),
            status: response.status,
        });
    }

    table.start(episode_id, &destination, response.content_length);

    tokio::fs::create_dir_all(&request.destination_dir)
        .await
        .map_err(|e| DownloadError::FileCreateFailed {
            path: request.destination_dir.clone(),
            source: e,
        })?;

    let partial_path = partial_path_for(&final_path);
    let mut file = match File::create(&partial_path).await {
        Ok(file) => file,
        Err(e) => {
            table.fail(episode_id, &destination, FailureCause::LocalWrite);
            return Err(DownloadError::FileCreateFailed {
                path: partial_path,
                source: e,
            });
        }
    };

    let mut bytes_downloaded: u64 = 0;
    let mut stream = response.body;

    while let Some(chunk_result) = stream.next().await {
        if table.is_cancel_requested(episode_id, &destination) {
            drop(file);
            discard_partial(&partial_path).await;
            table.fail(episode_id, &destination, FailureCause::Cancelled);
            log::info!("episode {}: download cancelled", episode_id);
            return Err(DownloadError::Cancelled);
        }

        let chunk = match chunk_result {
            Ok(chunk) => chunk,
            Err(e) => {
                drop(file);
                discard_partial(&partial_path).await;
                table.fail(episode_id, &destination, FailureCause::Network);
                return Err(DownloadError::StreamFailed {
                    url: request.source_url.clone(),
                    source: e,
                });
            }
        };

        if let Err(e) = file.write_all(&chunk).await {
            drop(file);
            discard_partial(&partial_path).await;
            table.fail(episode_id, &destination, FailureCause::LocalWrite);
            return Err(DownloadError::FileWriteFailed {
                path: partial_path,
                source: e,
            });
        }

        bytes_downloaded += chunk.len() as u64;
        table.record_chunk(episode_id, &destination, chunk.len() as u64);
    }

    // Verified write: everything on disk before the rename publishes it
    let finalize = async {
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&partial_path, &final_path).await
    };

    if let Err(e) = finalize.await {
        discard_partial(&partial_path).await;
        table.fail(episode_id, &destination, FailureCause::LocalWrite);
        return Err(DownloadError::FileWriteFailed {
            path: final_path,
            source: e,
        });
    }

    table.complete(episode_id, &destination);
    log::info!(
        "episode {}: downloaded {} bytes to {}",
        episode_id,
        bytes_downloaded,
        final_path.display()
    );

    Ok(DownloadOutcome {
        local_path: final_path,
        bytes_downloaded,
        fetched: true,
    })
}

/// Scheme check, performed before any network call.
fn validate_media_url(raw: &str) -> Result<(), String> {
    let url = Url::parse(raw).map_err(|e| e.to_string())?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!("unsupported scheme '{}'", other)),
    }
}

fn partial_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

async fn discard_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        log::warn!("failed to remove partial file {}: {}", path.display(), e);
    }
}
