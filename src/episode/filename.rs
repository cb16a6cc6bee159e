use sha2::{Digest, Sha256};
use url::Url;

use crate::store::EpisodeRecord;

/// Maximum length for the title portion of a filename
const MAX_TITLE_LENGTH: usize = 80;

/// Hex digits of the URL digest appended for collision avoidance
const DIGEST_LENGTH: usize = 8;

/// Generate the deterministic on-disk filename for an episode.
///
/// Format: `YYYY-MM-DD-title-digest.ext` (or `undated-...`). The digest is
/// derived from the source URL, so two episodes sharing a title on the same
/// day still resolve to distinct files, and repeated calls for one episode
/// always resolve to the same file.
pub fn episode_filename(record: &EpisodeRecord) -> String {
    let date_prefix = record
        .published_at
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "undated".to_string());

    let title = sanitize_title(&record.title);
    let digest = url_digest(&record.source_url);
    let ext = audio_extension(&record.source_url);

    if title.is_empty() {
        format!("{}-{}.{}", date_prefix, digest, ext)
    } else {
        format!("{}-{}-{}.{}", date_prefix, title, digest, ext)
    }
}

/// Short hex digest of the source URL
fn url_digest(source_url: &str) -> String {
    let digest = Sha256::digest(source_url.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..DIGEST_LENGTH].to_string()
}

/// Reduce a title to filesystem-safe characters.
fn sanitize_title(title: &str) -> String {
    let safe = sanitize_filename::sanitize(title);

    // Collapse whitespace and repeated dashes into single dashes
    let mut collapsed = String::with_capacity(safe.len());
    let mut last_was_separator = true;
    for c in safe.chars() {
        if c.is_whitespace() || c == '-' {
            if !last_was_separator {
                collapsed.push('-');
                last_was_separator = true;
            }
        } else if c.is_ascii_alphanumeric() || matches!(c, '_' | '.') {
            collapsed.push(c);
            last_was_separator = false;
        }
    }

    let trimmed = collapsed.trim_matches('-');
    if trimmed.len() > MAX_TITLE_LENGTH {
        truncate_at_boundary(trimmed, MAX_TITLE_LENGTH)
    } else {
        trimmed.to_string()
    }
}

/// Truncate at a dash boundary where one lands in the back half.
fn truncate_at_boundary(s: &str, max_len: usize) -> String {
    let truncated: String = s.chars().take(max_len).collect();
    if let Some(pos) = truncated.rfind('-')
        && pos > max_len / 2
    {
        return truncated[..pos].to_string();
    }

    truncated.trim_end_matches('-').to_string()
}

/// Audio extension from the URL path, defaulting to mp3.
fn audio_extension(source_url: &str) -> String {
    let from_path = Url::parse(source_url).ok().and_then(|url| {
        url.path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
            .and_then(|segment| segment.rsplit('.').next().map(str::to_lowercase))
            .filter(|ext| is_audio_extension(ext))
    });

    from_path.unwrap_or_else(|| "mp3".to_string())
}

fn is_audio_extension(ext: &str) -> bool {
    matches!(
        ext,
        "mp3" | "m4a" | "m4b" | "aac" | "ogg" | "opus" | "wav" | "flac"
    )
}
