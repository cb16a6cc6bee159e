use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::StoreError;

/// Episode row as the persistence layer hands it to the pipeline.
///
/// The pipeline never invents episodes; it only flips `downloaded` and the
/// device registry after a completed operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub id: i64,
    pub podcast_id: i64,
    pub title: String,
    /// Remote location of the media file
    pub source_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    /// Expected byte size from feed metadata, if the feed declared one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size_hint: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    pub downloaded: bool,
    /// Ids of devices this episode has been copied to
    pub on_device: HashSet<String>,
}

impl EpisodeRecord {
    /// Minimal record for an episode that has never been downloaded.
    pub fn new(id: i64, podcast_id: i64, title: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            id,
            podcast_id,
            title: title.into(),
            source_url: source_url.into(),
            published_at: None,
            file_size_hint: None,
            local_path: None,
            downloaded: false,
            on_device: HashSet::new(),
        }
    }
}

/// Persistence operations the pipeline consumes.
///
/// Implemented elsewhere over the application's database; `MemoryStore`
/// below covers tests and the demo binary.
#[async_trait]
pub trait EpisodeStore: Send + Sync {
    async fn get_episode(&self, id: i64) -> Result<EpisodeRecord, StoreError>;

    /// Record a verified successful download.
    async fn set_episode_downloaded(&self, id: i64, local_path: &Path) -> Result<(), StoreError>;

    /// Register the episode as present on a device.
    async fn set_episode_on_device(
        &self,
        id: i64,
        device_id: &str,
        device_path: &Path,
    ) -> Result<(), StoreError>;

    /// Drop a device from the episode's registry.
    async fn set_episode_removed_from_device(
        &self,
        id: i64,
        device_id: &str,
    ) -> Result<(), StoreError>;

    /// Clear the local download marker after the file is deleted.
    async fn clear_episode_downloaded(&self, id: i64) -> Result<(), StoreError>;
}

/// In-process store over a map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    episodes: RwLock<HashMap<i64, EpisodeRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: EpisodeRecord) {
        self.episodes.write().await.insert(record.id, record);
    }
}

#[async_trait]
impl EpisodeStore for MemoryStore {
    async fn get_episode(&self, id: i64) -> Result<EpisodeRecord, StoreError> {
        self.episodes
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn set_episode_downloaded(&self, id: i64, local_path: &Path) -> Result<(), StoreError> {
        let mut episodes = self.episodes.write().await;
        let record = episodes.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.downloaded = true;
        record.local_path = Some(local_path.to_path_buf());
        Ok(())
    }

    async fn set_episode_on_device(
        &self,
        id: i64,
        device_id: &str,
        _device_path: &Path,
    ) -> Result<(), StoreError> {
        let mut episodes = self.episodes.write().await;
        let record = episodes.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.on_device.insert(device_id.to_string());
        Ok(())
    }

    async fn set_episode_removed_from_device(
        &self,
        id: i64,
        device_id: &str,
    ) -> Result<(), StoreError> {
        let mut episodes = self.episodes.write().await;
        let record = episodes.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.on_device.remove(device_id);
        Ok(())
    }

    async fn clear_episode_downloaded(&self, id: i64) -> Result<(), StoreError> {
        let mut episodes = self.episodes.write().await;
        let record = episodes.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.downloaded = false;
        record.local_path = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_episode_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get_episode(42).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(42)));
    }

    #[tokio::test]
    async fn download_marker_round_trip() {
        let store = MemoryStore::new();
        store
            .insert(EpisodeRecord::new(1, 10, "Pilot", "https://example.com/pilot.mp3"))
            .await;

        store
            .set_episode_downloaded(1, Path::new("/episodes/10/pilot.mp3"))
            .await
            .unwrap();

        let record = store.get_episode(1).await.unwrap();
        assert!(record.downloaded);
        assert_eq!(
            record.local_path.as_deref(),
            Some(Path::new("/episodes/10/pilot.mp3"))
        );

        store.clear_episode_downloaded(1).await.unwrap();
        let record = store.get_episode(1).await.unwrap();
        assert!(!record.downloaded);
        assert!(record.local_path.is_none());
    }

    #[tokio::test]
    async fn device_registry_tracks_multiple_devices() {
        let store = MemoryStore::new();
        store
            .insert(EpisodeRecord::new(2, 10, "Two", "https://example.com/2.mp3"))
            .await;

        store
            .set_episode_on_device(2, "sansa", Path::new("/media/sansa/Podferry/10/two.mp3"))
            .await
            .unwrap();
        store
            .set_episode_on_device(2, "shuffle", Path::new("/media/shuffle/Podferry/10/two.mp3"))
            .await
            .unwrap();

        let record = store.get_episode(2).await.unwrap();
        assert_eq!(record.on_device.len(), 2);

        store
            .set_episode_removed_from_device(2, "sansa")
            .await
            .unwrap();
        let record = store.get_episode(2).await.unwrap();
        assert!(!record.on_device.contains("sansa"));
        assert!(record.on_device.contains("shuffle"));
    }
}
