use std::path::{Path, PathBuf};

use serde::Serialize;
use sysinfo::Disks;

use crate::error::CapacityError;

/// Total and available bytes of the volume backing a path.
///
/// Never cached: capacity can change between calls, so a fresh probe runs
/// immediately before any write that could exceed available space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VolumeCapacity {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// Seam over the filesystem probe so engines can be driven with a stub
/// in tests.
pub trait CapacityProbe: Send + Sync {
    fn check(&self, path: &Path) -> Result<VolumeCapacity, CapacityError>;
}

/// Probe backed by the OS disk list.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskProber;

impl DiskProber {
    pub fn new() -> Self {
        Self
    }
}

impl CapacityProbe for DiskProber {
    fn check(&self, path: &Path) -> Result<VolumeCapacity, CapacityError> {
        let resolved = std::fs::canonicalize(path)
            .map_err(|_| CapacityError::PathUnavailable(path.to_path_buf()))?;

        let disks = Disks::new_with_refreshed_list();
        let mounts = disks
            .iter()
            .map(|disk| {
                (
                    disk.mount_point().to_path_buf(),
                    VolumeCapacity {
                        total_bytes: disk.total_space(),
                        available_bytes: disk.available_space(),
                    },
                )
            })
            .collect::<Vec<_>>();

        best_mount_for(&resolved, &mounts)
            .ok_or_else(|| CapacityError::PathUnavailable(path.to_path_buf()))
    }
}

/// Pick the capacity of the most specific mount point covering `path`.
fn best_mount_for(path: &Path, mounts: &[(PathBuf, VolumeCapacity)]) -> Option<VolumeCapacity> {
    mounts
        .iter()
        .filter(|(mount, _)| path.starts_with(mount))
        .max_by_key(|(mount, _)| mount.as_os_str().len())
        .map(|(_, capacity)| *capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(total: u64, available: u64) -> VolumeCapacity {
        VolumeCapacity {
            total_bytes: total,
            available_bytes: available,
        }
    }

    #[test]
    fn picks_most_specific_mount() {
        let mounts = vec![
            (PathBuf::from("/"), cap(500, 100)),
            (PathBuf::from("/media/player"), cap(8, 4)),
        ];

        let chosen = best_mount_for(Path::new("/media/player/Podcasts"), &mounts).unwrap();
        assert_eq!(chosen, cap(8, 4));

        let root = best_mount_for(Path::new("/home/user"), &mounts).unwrap();
        assert_eq!(root, cap(500, 100));
    }

    #[test]
    fn no_covering_mount_yields_none() {
        let mounts = vec![(PathBuf::from("/media/player"), cap(8, 4))];
        assert!(best_mount_for(Path::new("/srv/data"), &mounts).is_none());
    }

    #[test]
    fn missing_path_is_unavailable() {
        let err = DiskProber::new()
            .check(Path::new("/definitely/not/a/mounted/volume"))
            .unwrap_err();
        assert!(matches!(err, CapacityError::PathUnavailable(_)));
    }
}
