pub mod capacity;
pub mod coordinator;
pub mod device;
pub mod episode;
pub mod error;
pub mod http;
pub mod progress;
pub mod store;

// Re-export main types for convenience
pub use capacity::{CapacityProbe, DiskProber, VolumeCapacity};
pub use coordinator::{Coordinator, PipelineOptions};
pub use device::{Device, detect_devices, device_for_mount};
pub use episode::episode_filename;
pub use error::{
    AlreadyInProgress, CapacityError, DownloadError, PipelineError, StoreError, TransferError,
};
pub use http::{HttpClient, ReqwestClient, StreamedResponse};
pub use progress::{
    FailureCause, ProgressTable, TransferDestination, TransferSnapshot, TransferStatus,
};
pub use store::{EpisodeRecord, EpisodeStore, MemoryStore};
