mod download;
mod filename;

pub use download::{DownloadOutcome, DownloadRequest, download_episode};
pub use filename::episode_filename;
