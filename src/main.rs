use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use colored::Colorize;
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};

use podferry::{
    Coordinator, Device, DiskProber, EpisodeRecord, EpisodeStore, MemoryStore, PipelineOptions,
    ReqwestClient, TransferDestination, TransferSnapshot, TransferStatus, device_for_mount,
};
use podferry::capacity::CapacityProbe;

// Emoji with fallback for terminals without Unicode support
static DOWNLOAD: Emoji<'_, '_> = Emoji("📥 ", "[v] ");
static FERRY: Emoji<'_, '_> = Emoji("⛴️  ", "[>] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");

/// Download a podcast episode and optionally ferry it to a removable device
#[derive(Parser, Debug)]
#[command(name = "podferry")]
#[command(about = "Download podcast episodes and copy them to removable players")]
#[command(version)]
struct Args {
    /// Episode media URL
    url: Option<String>,

    /// Directory downloads land in
    output_dir: Option<PathBuf>,

    /// Episode title used for the on-disk filename
    #[arg(short, long, default_value = "episode")]
    title: String,

    /// Podcast id used for the podcast-scoped folder
    #[arg(short, long, default_value = "1")]
    podcast_id: i64,

    /// Mount path of a device to copy the episode onto after downloading
    #[arg(long)]
    transfer_to: Option<PathBuf>,

    /// List detected removable devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.list_devices {
        list_devices();
        return Ok(());
    }

    let (Some(url), Some(output_dir)) = (args.url.clone(), args.output_dir.clone()) else {
        bail!("URL and OUTPUT_DIR are required unless --list-devices is given");
    };

    let store = Arc::new(MemoryStore::new());
    let mut record = EpisodeRecord::new(1, args.podcast_id, &args.title, &url);
    record.published_at = Some(chrono::Utc::now());
    store.insert(record).await;

    let coordinator = Coordinator::new(
        ReqwestClient::new(),
        store.clone() as Arc<dyn podferry::EpisodeStore>,
        Arc::new(DiskProber::new()),
        PipelineOptions::new(&output_dir),
    );

    println!("{}Downloading {}", DOWNLOAD, url.cyan());
    coordinator.start_download(1).await?;
    let snapshot = watch(&coordinator, 1, &TransferDestination::Local).await;

    match snapshot.status {
        TransferStatus::Completed => {
            let record = store.get_episode(1).await?;
            let local = record.local_path.context("download completed without a path")?;
            println!("{}Saved {}", SUCCESS, local.display().to_string().green());
        }
        TransferStatus::Failed(cause) => {
            bail!("{}download failed: {:?}", FAILURE, cause);
        }
        _ => unreachable!("watch returns only terminal snapshots"),
    }

    if let Some(mount) = args.transfer_to {
        let device = resolve_device(&mount)?;
        println!(
            "{}Ferrying to {} ({} free)",
            FERRY,
            device.name.cyan(),
            indicatif::HumanBytes(device.available_bytes)
        );

        coordinator.start_transfer(1, &device).await?;
        let destination = TransferDestination::Device(device.id.clone());
        let snapshot = watch(&coordinator, 1, &destination).await;

        match snapshot.status {
            TransferStatus::Completed => {
                println!("{}Episode is on the device", SUCCESS);
            }
            TransferStatus::Failed(cause) => {
                bail!("{}transfer failed: {:?}", FAILURE, cause);
            }
            _ => unreachable!("watch returns only terminal snapshots"),
        }
    }

    Ok(())
}

/// Poll an operation to its terminal state, rendering a progress bar.
async fn watch(
    coordinator: &Coordinator<ReqwestClient>,
    episode_id: i64,
    destination: &TransferDestination,
) -> TransferSnapshot {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("  [{bar:30.cyan/blue}] {bytes}/{total_bytes} {msg}")
            .unwrap()
            .progress_chars("█▓░"),
    );

    loop {
        if let Some(snapshot) = coordinator.get_progress(episode_id, destination) {
            if let Some(total) = snapshot.bytes_total {
                bar.set_length(total);
            }
            bar.set_position(snapshot.bytes_transferred);
            if snapshot.speed_bytes_per_sec > 0.0 {
                let eta = snapshot
                    .eta_seconds
                    .map(|s| format!(", {}s left", s))
                    .unwrap_or_default();
                bar.set_message(format!(
                    "{}/s{}",
                    indicatif::HumanBytes(snapshot.speed_bytes_per_sec as u64),
                    eta
                ));
            }

            if snapshot.status.is_terminal() {
                bar.finish_and_clear();
                return snapshot;
            }
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn list_devices() {
    let devices = podferry::detect_devices();
    if devices.is_empty() {
        println!("No removable devices detected");
        return;
    }

    for device in devices {
        println!(
            "{}  {} ({} free of {})",
            device.id.bold(),
            device.mount_path.display(),
            indicatif::HumanBytes(device.available_bytes),
            indicatif::HumanBytes(device.total_bytes)
        );
    }
}

/// Accept either a real mount point or any writable directory (probed for
/// capacity) as the transfer target.
fn resolve_device(mount: &Path) -> Result<Device> {
    if let Ok(device) = device_for_mount(mount) {
        return Ok(device);
    }

    let capacity = DiskProber::new()
        .check(mount)
        .with_context(|| format!("{} is not an available volume", mount.display()))?;

    Ok(Device {
        id: mount.to_string_lossy().replace(['/', '\\'], "_"),
        name: mount.display().to_string(),
        mount_path: mount.to_path_buf(),
        total_bytes: capacity.total_bytes,
        available_bytes: capacity.available_bytes,
    })
}
