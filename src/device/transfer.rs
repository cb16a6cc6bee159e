// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::capacity::CapacityProbe;
use crate::device::Device;
use crate::error::TransferError;
use crate::progress::{FailureCause, ProgressTable, TransferDestination};

/// Copy buffer size; progress is recorded after each buffer lands
const COPY_BUFFER: usize = 64 * 1024;

const PARTIAL_SUFFIX: &str = ".partial";

/// What the engine needs to copy one downloaded episode onto a device.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub episode_id: i64,
    /// Completed local download to copy from
    pub local_path: PathBuf,
    /// Top-level folder on the device holding all transfers
    pub folder_root: String,
    /// Per-podcast subfolder keeping episodes organized by show
    pub podcast_folder: String,
}

/// Result of a successful device copy.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub device_path: PathBuf,
    pub bytes_copied: u64,
}

/// Copy an episode file into a podcast-scoped folder on a device.
///
/// The operation must already be admitted to `table` under
/// `(episode_id, Device(id))`. Capacity is probed immediately before any
/// write; a file that does not fit fails `InsufficientSpace` with zero
/// bytes written. Mid-copy failures and cancellation remove the partial
/// destination file, so the device never holds a torn episode.
pub async fn transfer_episode<P: CapacityProbe + ?Sized>(
    prober: &P,
    request: &TransferRequest,
    device: &Device,
    table: &ProgressTable,
) -> Result<TransferOutcome, TransferError> {
    let episode_id = request.episode_id;
    let destination = TransferDestination::Device(device.id.clone());

    let source_meta = match tokio::fs::metadata(&request.local_path).await {
        Ok(meta) if meta.is_file() => meta,
        _ => {
            table.fail(episode_id, &destination, FailureCause::SourceMissing);
            return Err(TransferError::SourceMissing(request.local_path.clone()));
        }
    };
    let file_size = source_meta.len();

    let capacity = match prober.check(&device.mount_path) {
        Ok(capacity) => capacity,
        Err(e) => {
            table.fail(episode_id, &destination, FailureCause::PathUnavailable);
            return Err(TransferError::Capacity(e));
        }
    };

    if capacity.available_bytes < file_size {
        table.fail(episode_id, &destination, FailureCause::InsufficientSpace);
        return Err(TransferError::InsufficientSpace {
            needed: file_size,
            available: capacity.available_bytes,
        });
    }

    let target_dir = device
        .mount_path
        .join(&request.folder_root)
        .join(&request.podcast_folder);
    if let Err(e) = tokio::fs::create_dir_all(&target_dir).await {
        let cause = classify_device_failure(&device.mount_path);
        table.fail(episode_id, &destination, cause);
        return Err(TransferError::CreateDirFailed {
            path: target_dir,
            source: e,
        });
    }

    let filename = request
        .local_path
        .file_name()
        .map(|name| name.to_os_string())
        .ok_or_else(|| TransferError::SourceMissing(request.local_path.clone()))?;
    let final_path = target_dir.join(&filename);
    let partial_path = {
        let mut name = final_path.as_os_str().to_os_string();
        name.push(PARTIAL_SUFFIX);
        PathBuf::from(name)
    };

    table.start(episode_id, &destination, Some(file_size));

    let result = buffered_copy(
        &request.local_path,
        &partial_path,
        episode_id,
        &destination,
        device,
        table,
    )
    .await;

    let bytes_copied = match result {
        Ok(bytes) => bytes,
        Err(e) => {
            discard_partial(&partial_path).await;
            let cause = match &e {
                TransferError::Cancelled => FailureCause::Cancelled,
                TransferError::DeviceRemoved(_) => FailureCause::DeviceRemoved,
                TransferError::SourceMissing(_) => FailureCause::SourceMissing,
                _ => FailureCause::DeviceWrite,
            };
            table.fail(episode_id, &destination, cause);
            return Err(e);
        }
    };

    if let Err(e) = tokio::fs::rename(&partial_path, &final_path).await {
        discard_partial(&partial_path).await;
        let cause = classify_device_failure(&device.mount_path);
        table.fail(episode_id, &destination, cause);
        return Err(TransferError::DeviceWriteFailed {
            path: final_path,
            source: e,
        });
    }

    table.complete(episode_id, &destination);
    log::info!(
        "episode {}: copied {} bytes to {}",
        episode_id,
        bytes_copied,
        final_path.display()
    );

    Ok(TransferOutcome {
        device_path: final_path,
        bytes_copied,
    })
}

async fn buffered_copy(
    source: &Path,
    partial: &Path,
    episode_id: i64,
    destination: &TransferDestination,
    device: &Device,
    table: &ProgressTable,
) -> Result<u64, TransferError> {
    let mut source_file = File::open(source)
        .await
        .map_err(|_| TransferError::SourceMissing(source.to_path_buf()))?;

    let mut dest_file = match File::create(partial).await {
        Ok(file) => file,
        Err(e) => {
            return Err(device_write_error(partial, e, &device.mount_path));
        }
    };

    let mut buffer = vec![0u8; COPY_BUFFER];
    let mut copied: u64 = 0;

    loop {
        if table.is_cancel_requested(episode_id, destination) {
            log::info!("episode {}: transfer to {} cancelled", episode_id, device.id);
            return Err(TransferError::Cancelled);
        }

        let read = source_file
            .read(&mut buffer)
            .await
            .map_err(|_| TransferError::SourceMissing(source.to_path_buf()))?;
        if read == 0 {
            break;
        }

        if let Err(e) = dest_file.write_all(&buffer[..read]).await {
            return Err(device_write_error(partial, e, &device.mount_path));
        }

        copied += read as u64;
        table.record_chunk(episode_id, destination, read as u64);

        // Yield between buffers so pollers and cancellation keep up on
        // fast local copies
        tokio::task::yield_now().await;
    }

    dest_file
        .flush()
        .await
        .map_err(|e| device_write_error(partial, e, &device.mount_path))?;
    dest_file
        .sync_all()
        .await
        .map_err(|e| device_write_error(partial, e, &device.mount_path))?;

    Ok(copied)
}

/// A write failure on a vanished mount means the device was pulled.
fn device_write_error(path: &Path, source: std::io::Error, mount: &Path) -> TransferError {
    if !mount.exists() {
        TransferError::DeviceRemoved(mount.to_path_buf())
    } else {
        TransferError::DeviceWriteFailed {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn classify_device_failure(mount: &Path) -> FailureCause {
    if mount.exists() {
        FailureCause::DeviceWrite
    } else {
        FailureCause::DeviceRemoved
    }
}

async fn discard_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        log::warn!("failed to remove partial file {}: {}", path.display(), e);
    }
}
