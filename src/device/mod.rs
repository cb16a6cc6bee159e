mod transfer;

pub use transfer::{TransferOutcome, TransferRequest, transfer_episode};

use std::path::{Path, PathBuf};

use serde::Serialize;
use sysinfo::Disks;

use crate::error::{CapacityError, TransferError};

/// A removable volume episodes can be copied onto.
///
/// Capacity fields reflect the moment the device was listed; the transfer
/// engine re-probes immediately before writing.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub mount_path: PathBuf,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// List mounted volumes that look like removable players.
pub fn detect_devices() -> Vec<Device> {
    let disks = Disks::new_with_refreshed_list();
    let mut devices = Vec::new();

    for disk in &disks {
        if !is_removable_mount(disk) {
            continue;
        }

        let name = disk.name().to_string_lossy().to_string();
        let mount_path = disk.mount_point().to_path_buf();
        devices.push(Device {
            id: device_id(&name, &mount_path),
            name: if name.is_empty() { "Removable device".to_string() } else { name },
            mount_path,
            total_bytes: disk.total_space(),
            available_bytes: disk.available_space(),
        });
    }

    log::info!("detected {} removable device(s)", devices.len());
    devices
}

/// Resolve a device record for an explicit mount path.
pub fn device_for_mount(mount_path: &Path) -> Result<Device, CapacityError> {
    let disks = Disks::new_with_refreshed_list();

    for disk in &disks {
        if disk.mount_point() == mount_path {
            let name = disk.name().to_string_lossy().to_string();
            return Ok(Device {
                id: device_id(&name, mount_path),
                name: if name.is_empty() { "Removable device".to_string() } else { name },
                mount_path: mount_path.to_path_buf(),
                total_bytes: disk.total_space(),
                available_bytes: disk.available_space(),
            });
        }
    }

    Err(CapacityError::PathUnavailable(mount_path.to_path_buf()))
}

/// Stable id from the volume name and mount point.
fn device_id(name: &str, mount_path: &Path) -> String {
    let mount = mount_path.to_string_lossy();
    format!(
        "{}_{}",
        name.replace([' ', '/'], "_"),
        mount.replace(['/', '\\'], "_")
    )
}

fn is_removable_mount(disk: &sysinfo::Disk) -> bool {
    let mount = disk.mount_point().to_string_lossy().to_lowercase();
    let name = disk.name().to_string_lossy().to_lowercase();

    let looks_removable = disk.is_removable()
        || ["/media/", "/run/media/", "/mnt/", "/volumes/"]
            .iter()
            .any(|prefix| mount.starts_with(prefix))
        || name.contains("usb");

    // A volume with no readable capacity is not usable as a target
    looks_removable && disk.total_space() > 0
}

/// Delete an episode file from a device's podcast folder.
///
/// The folder layout mirrors what `transfer_episode` creates:
/// `<mount>/<folder_root>/<podcast_folder>/<filename>`.
pub async fn remove_from_device(
    device: &Device,
    folder_root: &str,
    podcast_folder: &str,
    filename: &str,
) -> Result<(), TransferError> {
    if !device.mount_path.exists() {
        return Err(TransferError::Capacity(CapacityError::PathUnavailable(
            device.mount_path.clone(),
        )));
    }

    let file_path = device
        .mount_path
        .join(folder_root)
        .join(podcast_folder)
        .join(filename);

    if !file_path.exists() {
        return Err(TransferError::NotOnDevice(file_path));
    }

    tokio::fs::remove_file(&file_path)
        .await
        .map_err(|e| TransferError::DeviceWriteFailed {
            path: file_path.clone(),
            source: e,
        })?;

    log::info!("removed {} from device {}", file_path.display(), device.id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn device_at(mount: &Path) -> Device {
        Device {
            id: "test-device".to_string(),
            name: "Test Player".to_string(),
            mount_path: mount.to_path_buf(),
            total_bytes: 8 * 1024 * 1024,
            available_bytes: 4 * 1024 * 1024,
        }
    }

    #[test]
    fn device_ids_contain_no_path_separators() {
        let id = device_id("My Player", Path::new("/media/user/player"));
        assert!(!id.contains('/'));
        assert!(!id.contains('\\'));
        assert!(!id.contains(' '));
    }

    #[test]
    fn detect_devices_never_lists_the_root_filesystem() {
        for device in detect_devices() {
            assert_ne!(device.mount_path, Path::new("/"));
            assert!(device.total_bytes > 0);
        }
    }

    #[tokio::test]
    async fn remove_deletes_only_the_episode_file() {
        let mount = tempdir().unwrap();
        let folder = mount.path().join("Podferry").join("10");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("ep.mp3"), b"on device").unwrap();
        std::fs::write(folder.join("other.mp3"), b"stays").unwrap();

        remove_from_device(&device_at(mount.path()), "Podferry", "10", "ep.mp3")
            .await
            .unwrap();

        assert!(!folder.join("ep.mp3").exists());
        assert!(folder.join("other.mp3").exists());
        assert!(folder.exists());
    }

    #[tokio::test]
    async fn remove_missing_file_reports_not_on_device() {
        let mount = tempdir().unwrap();
        let err = remove_from_device(&device_at(mount.path()), "Podferry", "10", "ghost.mp3")
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::NotOnDevice(_)));
    }

    #[tokio::test]
    async fn remove_from_vanished_mount_is_unavailable() {
        let err = remove_from_device(
            &device_at(Path::new("/no/such/mount")),
            "Podferry",
            "10",
            "ep.mp3",
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Capacity(CapacityError::PathUnavailable(_))
        ));
    }
}
