// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::capacity::CapacityProbe;
use crate::device::{self, Device, TransferRequest, transfer_episode};
use crate::episode::{DownloadRequest, download_episode, episode_filename};
use crate::error::{AlreadyInProgress, PipelineError, TransferError};
use crate::http::HttpClient;
use crate::progress::{ProgressTable, TransferDestination, TransferSnapshot};
use crate::store::EpisodeStore;

/// Tuning for the pipeline. The download directory is the only required
/// setting; everything else has workable defaults.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Root directory downloads land in, one subdirectory per podcast
    pub download_dir: PathBuf,
    /// Top-level folder created on devices
    pub device_folder: String,
    /// Rolling-speed sample window
    pub sample_window: Duration,
    /// How long finished operations stay pollable
    pub terminal_retention: Duration,
}

impl PipelineOptions {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            device_folder: "Podferry".to_string(),
            sample_window: Duration::from_millis(500),
            terminal_retention: Duration::from_secs(30),
        }
    }
}

/// Orchestrates downloads and device transfers for episodes.
///
/// Owns admission control (at most one live operation per
/// (episode, destination) key), spawns the engines as independent tasks,
/// and translates completed operations into persistence writes. All
/// methods return promptly; long-running work is observed through
/// `get_progress`.
pub struct Coordinator<C: HttpClient + Clone + 'static> {
    client: C,
    store: Arc<dyn EpisodeStore>,
    prober: Arc<dyn CapacityProbe>,
    table: Arc<ProgressTable>,
    options: PipelineOptions,
}

impl<C: HttpClient + Clone + 'static> Coordinator<C> {
    pub fn new(
        client: C,
        store: Arc<dyn EpisodeStore>,
        prober: Arc<dyn CapacityProbe>,
        options: PipelineOptions,
    ) -> Self {
        let table = Arc::new(ProgressTable::with_tuning(
            options.sample_window,
            options.terminal_retention,
        ));
        Self {
            client,
            store,
            prober,
            table,
            options,
        }
    }

    /// The shared operation table, for callers that want to poll it
    /// directly.
    pub fn progress_table(&self) -> Arc<ProgressTable> {
        self.table.clone()
    }

    /// Begin downloading an episode in the background.
    ///
    /// Rejects with `AlreadyInProgress` while a live download exists for
    /// the episode. On completion the episode is persisted as downloaded
    /// with its local path; on failure the episode record is untouched and
    /// the cause is readable from the operation table.
    pub async fn start_download(&self, episode_id: i64) -> Result<(), PipelineError> {
        let record = self.store.get_episode(episode_id).await?;

        let request = DownloadRequest {
            episode_id,
            source_url: record.source_url.clone(),
            destination_dir: self
                .options
                .download_dir
                .join(record.podcast_id.to_string()),
            filename: episode_filename(&record),
        };

        self.table
            .begin(episode_id, TransferDestination::Local, record.file_size_hint)?;
        log::info!("episode {}: download admitted from {}", episode_id, record.source_url);

        let client = self.client.clone();
        let store = self.store.clone();
        let table = self.table.clone();
        tokio::spawn(async move {
            match download_episode(&client, &request, &table).await {
                Ok(outcome) => {
                    if let Err(e) = store
                        .set_episode_downloaded(episode_id, &outcome.local_path)
                        .await
                    {
                        log::error!(
                            "episode {}: downloaded but status write failed: {}",
                            episode_id,
                            e
                        );
                    }
                }
                Err(e) => {
                    log::warn!("episode {}: download failed: {}", episode_id, e);
                }
            }
        });

        Ok(())
    }

    /// Begin copying a downloaded episode onto a device in the background.
    ///
    /// Admission is per (episode, device): the same episode may stream to
    /// two different devices at once, never twice to the same one. On
    /// completion the device is added to the episode's registry.
    pub async fn start_transfer(
        &self,
        episode_id: i64,
        device: &Device,
    ) -> Result<(), PipelineError> {
        let record = self.store.get_episode(episode_id).await?;

        let local_path = match record.local_path {
            Some(ref path) if record.downloaded => path.clone(),
            _ => return Err(PipelineError::NotDownloaded(episode_id)),
        };

        let request = TransferRequest {
            episode_id,
            local_path,
            folder_root: self.options.device_folder.clone(),
            podcast_folder: record.podcast_id.to_string(),
        };

        let destination = TransferDestination::Device(device.id.clone());
        self.table
            .begin(episode_id, destination, record.file_size_hint)?;
        log::info!(
            "episode {}: transfer admitted to device {}",
            episode_id,
            device.id
        );

        let store = self.store.clone();
        let prober = self.prober.clone();
        let table = self.table.clone();
        let device = device.clone();
        tokio::spawn(async move {
            match transfer_episode(prober.as_ref(), &request, &device, &table).await {
                Ok(outcome) => {
                    if let Err(e) = store
                        .set_episode_on_device(episode_id, &device.id, &outcome.device_path)
                        .await
                    {
                        log::error!(
                            "episode {}: transferred but registry write failed: {}",
                            episode_id,
                            e
                        );
                    }
                }
                Err(e) => {
                    log::warn!(
                        "episode {}: transfer to {} failed: {}",
                        episode_id,
                        device.id,
                        e
                    );
                }
            }
        });

        Ok(())
    }

    /// Poll the state of an operation. `None` means no operation is known
    /// for the key (never started, or evicted after the retention window).
    pub fn get_progress(
        &self,
        episode_id: i64,
        destination: &TransferDestination,
    ) -> Option<TransferSnapshot> {
        self.table.get(episode_id, destination)
    }

    /// Request cancellation of a live operation. Returns whether one was
    /// found; the operation reads as `Failed(Cancelled)` within a sample
    /// interval.
    pub fn cancel(&self, episode_id: i64, destination: &TransferDestination) -> bool {
        self.table.request_cancel(episode_id, destination)
    }

    /// Delete an episode's local download and clear its marker.
    ///
    /// Refused while a download for the episode is live.
    pub async fn delete_download(&self, episode_id: i64) -> Result<(), PipelineError> {
        if let Some(snap) = self.table.get(episode_id, &TransferDestination::Local)
            && !snap.status.is_terminal()
        {
            return Err(AlreadyInProgress {
                episode_id,
                destination: TransferDestination::Local,
            }
            .into());
        }

        let record = self.store.get_episode(episode_id).await?;
        if let Some(path) = record.local_path
            && let Err(e) = tokio::fs::remove_file(&path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            log::warn!("episode {}: could not delete {}: {}", episode_id, path.display(), e);
        }

        self.store.clear_episode_downloaded(episode_id).await?;
        Ok(())
    }

    /// Remove an episode's file from a device and drop the device from the
    /// episode's registry.
    pub async fn remove_from_device(
        &self,
        episode_id: i64,
        device: &Device,
    ) -> Result<(), PipelineError> {
        let record = self.store.get_episode(episode_id).await?;
        let filename = episode_filename(&record);

        device::remove_from_device(
            device,
            &self.options.device_folder,
            &record.podcast_id.to_string(),
            &filename,
        )
        .await
        .map_err(|source| transfer_error(episode_id, &device.id, source))?;

        self.store
            .set_episode_removed_from_device(episode_id, &device.id)
            .await?;
        Ok(())
    }
}

fn transfer_error(episode_id: i64, device_id: &str, source: TransferError) -> PipelineError {
    PipelineError::Transfer {
        episode_id,
        device_id: device_id.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::VolumeCapacity;
    use crate::error::CapacityError;
    use crate::http::{ByteStream, StreamedResponse};
    use crate::progress::{FailureCause, TransferStatus};
    use crate::store::{EpisodeRecord, MemoryStore};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Mock transport: a fixed payload in delayed chunks, a counter of
    /// opened requests, and an optional number of leading attempts that
    /// fail with a 503.
    #[derive(Clone)]
    struct MockHttpClient {
        payload: Vec<u8>,
        chunk_delay: Duration,
        failures_before_success: usize,
        requests: Arc<AtomicUsize>,
    }

    impl MockHttpClient {
        fn serving(payload: &[u8]) -> Self {
            Self {
                payload: payload.to_vec(),
                chunk_delay: Duration::ZERO,
                failures_before_success: 0,
                requests: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn slow(mut self) -> Self {
            self.chunk_delay = Duration::from_millis(15);
            self
        }

        fn failing_once(mut self) -> Self {
            self.failures_before_success = 1;
            self
        }

        fn request_count(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn get_stream(&self, _url: &str) -> Result<StreamedResponse, reqwest::Error> {
            let attempt = self.requests.fetch_add(1, Ordering::SeqCst);

            if attempt < self.failures_before_success {
                let empty: ByteStream = Box::pin(futures::stream::empty());
                return Ok(StreamedResponse {
                    status: 503,
                    content_length: None,
                    body: empty,
                });
            }

            let chunks: Vec<Bytes> = self
                .payload
                .chunks(1024)
                .map(Bytes::copy_from_slice)
                .collect();
            let delay = self.chunk_delay;
            let stream: ByteStream = Box::pin(futures::stream::iter(chunks).then(
                move |chunk| async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(chunk)
                },
            ));

            Ok(StreamedResponse {
                status: 200,
                content_length: Some(self.payload.len() as u64),
                body: stream,
            })
        }
    }

    struct StubProber {
        available: u64,
    }

    impl CapacityProbe for StubProber {
        fn check(&self, _path: &Path) -> Result<VolumeCapacity, CapacityError> {
            Ok(VolumeCapacity {
                total_bytes: self.available * 2,
                available_bytes: self.available,
            })
        }
    }

    fn device_at(mount: &Path) -> Device {
        Device {
            id: "player".to_string(),
            name: "Player".to_string(),
            mount_path: mount.to_path_buf(),
            total_bytes: 0,
            available_bytes: 0,
        }
    }

    async fn coordinator_with(
        client: MockHttpClient,
        download_dir: &Path,
        available_device_bytes: u64,
    ) -> (Coordinator<MockHttpClient>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store
            .insert(EpisodeRecord::new(
                1,
                10,
                "Pilot",
                "https://example.com/show/pilot.mp3",
            ))
            .await;

        let mut options = PipelineOptions::new(download_dir);
        options.sample_window = Duration::from_millis(1);

        let coordinator = Coordinator::new(
            client,
            store.clone() as Arc<dyn EpisodeStore>,
            Arc::new(StubProber {
                available: available_device_bytes,
            }),
            options,
        );
        (coordinator, store)
    }

    async fn wait_terminal(
        coordinator: &Coordinator<MockHttpClient>,
        episode_id: i64,
        destination: &TransferDestination,
    ) -> TransferSnapshot {
        for _ in 0..1000 {
            if let Some(snap) = coordinator.get_progress(episode_id, destination)
                && snap.status.is_terminal()
            {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("operation never reached a terminal state");
    }

    async fn wait_until(check: impl AsyncFn() -> bool) {
        for _ in 0..1000 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn concurrent_download_requests_fetch_once() {
        let dir = tempdir().unwrap();
        let client = MockHttpClient::serving(&vec![7u8; 8 * 1024]).slow();
        let (coordinator, store) = coordinator_with(client.clone(), dir.path(), 0).await;

        coordinator.start_download(1).await.unwrap();
        let second = coordinator.start_download(1).await;
        assert!(matches!(
            second,
            Err(PipelineError::AlreadyInProgress(_))
        ));

        let snap = wait_terminal(&coordinator, 1, &TransferDestination::Local).await;
        assert_eq!(snap.status, TransferStatus::Completed);
        assert_eq!(client.request_count(), 1);

        wait_until(async || store.get_episode(1).await.unwrap().downloaded).await;
        let record = store.get_episode(1).await.unwrap();
        let local = record.local_path.unwrap();
        assert!(local.starts_with(dir.path().join("10")));
        assert_eq!(std::fs::metadata(&local).unwrap().len(), 8 * 1024);
    }

    #[tokio::test]
    async fn failed_download_leaves_record_untouched_and_allows_retry() {
        let dir = tempdir().unwrap();
        let client = MockHttpClient::serving(b"recovered payload").failing_once();
        let (coordinator, store) = coordinator_with(client.clone(), dir.path(), 0).await;

        coordinator.start_download(1).await.unwrap();
        let snap = wait_terminal(&coordinator, 1, &TransferDestination::Local).await;
        assert_eq!(
            snap.status,
            TransferStatus::Failed(FailureCause::Http { status: 503 })
        );
        assert!(!store.get_episode(1).await.unwrap().downloaded);

        // The failure is terminal, so an immediate retry is admitted
        coordinator.start_download(1).await.unwrap();
        let snap = wait_terminal(&coordinator, 1, &TransferDestination::Local).await;
        assert_eq!(snap.status, TransferStatus::Completed);

        wait_until(async || store.get_episode(1).await.unwrap().downloaded).await;
        assert_eq!(client.request_count(), 2);
    }

    #[tokio::test]
    async fn cancel_stops_download_and_leaves_no_file() {
        let dir = tempdir().unwrap();
        let client = MockHttpClient::serving(&vec![1u8; 64 * 1024]).slow();
        let (coordinator, store) = coordinator_with(client, dir.path(), 0).await;

        coordinator.start_download(1).await.unwrap();
        wait_until(async || {
            coordinator
                .get_progress(1, &TransferDestination::Local)
                .map(|snap| snap.bytes_transferred > 0)
                .unwrap_or(false)
        })
        .await;

        assert!(coordinator.cancel(1, &TransferDestination::Local));

        let snap = wait_terminal(&coordinator, 1, &TransferDestination::Local).await;
        assert_eq!(snap.status, TransferStatus::Failed(FailureCause::Cancelled));
        assert!(!store.get_episode(1).await.unwrap().downloaded);

        let podcast_dir = dir.path().join("10");
        if podcast_dir.exists() {
            assert_eq!(std::fs::read_dir(&podcast_dir).unwrap().count(), 0);
        }
    }

    #[tokio::test]
    async fn transfer_requires_a_completed_download() {
        let dir = tempdir().unwrap();
        let mount = tempdir().unwrap();
        let client = MockHttpClient::serving(b"unused");
        let (coordinator, _store) = coordinator_with(client, dir.path(), 1024 * 1024).await;

        let err = coordinator
            .start_transfer(1, &device_at(mount.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotDownloaded(1)));
    }

    #[tokio::test]
    async fn transfer_copies_file_and_updates_registry() {
        let dir = tempdir().unwrap();
        let mount = tempdir().unwrap();
        let client = MockHttpClient::serving(b"downloaded episode payload");
        let (coordinator, store) = coordinator_with(client, dir.path(), 1024 * 1024).await;

        coordinator.start_download(1).await.unwrap();
        wait_terminal(&coordinator, 1, &TransferDestination::Local).await;
        wait_until(async || store.get_episode(1).await.unwrap().downloaded).await;

        let device = device_at(mount.path());
        coordinator.start_transfer(1, &device).await.unwrap();

        let destination = TransferDestination::Device(device.id.clone());
        let snap = wait_terminal(&coordinator, 1, &destination).await;
        assert_eq!(snap.status, TransferStatus::Completed);

        wait_until(async || {
            store
                .get_episode(1)
                .await
                .unwrap()
                .on_device
                .contains(&device.id)
        })
        .await;

        let record = store.get_episode(1).await.unwrap();
        let filename = record
            .local_path
            .as_ref()
            .unwrap()
            .file_name()
            .unwrap()
            .to_os_string();
        let on_device = mount.path().join("Podferry").join("10").join(filename);
        assert_eq!(
            std::fs::read(on_device).unwrap(),
            b"downloaded episode payload"
        );
    }

    #[tokio::test]
    async fn transfer_to_full_device_fails_without_registry_change() {
        let dir = tempdir().unwrap();
        let mount = tempdir().unwrap();
        let client = MockHttpClient::serving(&vec![2u8; 4096]);
        let (coordinator, store) = coordinator_with(client, dir.path(), 16).await;

        coordinator.start_download(1).await.unwrap();
        wait_terminal(&coordinator, 1, &TransferDestination::Local).await;
        wait_until(async || store.get_episode(1).await.unwrap().downloaded).await;

        let device = device_at(mount.path());
        coordinator.start_transfer(1, &device).await.unwrap();

        let destination = TransferDestination::Device(device.id.clone());
        let snap = wait_terminal(&coordinator, 1, &destination).await;
        assert_eq!(
            snap.status,
            TransferStatus::Failed(FailureCause::InsufficientSpace)
        );

        assert!(store.get_episode(1).await.unwrap().on_device.is_empty());
        assert!(!mount.path().join("Podferry").exists());
    }

    #[tokio::test]
    async fn delete_download_clears_file_and_marker() {
        let dir = tempdir().unwrap();
        let client = MockHttpClient::serving(b"to be deleted");
        let (coordinator, store) = coordinator_with(client, dir.path(), 0).await;

        coordinator.start_download(1).await.unwrap();
        wait_terminal(&coordinator, 1, &TransferDestination::Local).await;
        wait_until(async || store.get_episode(1).await.unwrap().downloaded).await;
        let local = store.get_episode(1).await.unwrap().local_path.unwrap();

        coordinator.delete_download(1).await.unwrap();
        assert!(!local.exists());
        let record = store.get_episode(1).await.unwrap();
        assert!(!record.downloaded);
        assert!(record.local_path.is_none());
    }

    #[tokio::test]
    async fn remove_from_device_clears_registry_entry() {
        let dir = tempdir().unwrap();
        let mount = tempdir().unwrap();
        let client = MockHttpClient::serving(b"episode on device");
        let (coordinator, store) = coordinator_with(client, dir.path(), 1024 * 1024).await;

        coordinator.start_download(1).await.unwrap();
        wait_terminal(&coordinator, 1, &TransferDestination::Local).await;
        wait_until(async || store.get_episode(1).await.unwrap().downloaded).await;

        let device = device_at(mount.path());
        coordinator.start_transfer(1, &device).await.unwrap();
        let destination = TransferDestination::Device(device.id.clone());
        wait_terminal(&coordinator, 1, &destination).await;
        wait_until(async || !store.get_episode(1).await.unwrap().on_device.is_empty()).await;

        coordinator.remove_from_device(1, &device).await.unwrap();
        let record = store.get_episode(1).await.unwrap();
        assert!(record.on_device.is_empty());
    }

    #[tokio::test]
    async fn progress_is_none_for_unknown_operations() {
        let dir = tempdir().unwrap();
        let client = MockHttpClient::serving(b"unused");
        let (coordinator, _store) = coordinator_with(client, dir.path(), 0).await;

        assert!(
            coordinator
                .get_progress(99, &TransferDestination::Local)
                .is_none()
        );
        assert!(!coordinator.cancel(99, &TransferDestination::Local));
    }
}
