//! Optionally writes a session's raw audio to disk once the session ends.
//!
//! Creates the target directory, builds a dated `<date>_<user>_<time>.pcm`
//! filename, and writes once at session end. No `chrono` dependency: a
//! single coarse timestamp doesn't need calendar arithmetic.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Writes `pcm` (raw 16-bit LE mono samples) to
/// `<pcm_path>/<date>_<user>_<time>.pcm`. No-op (returns `Ok` with no file
/// written) when `pcm` is empty, since an utterance-free session leaves
/// nothing worth dumping.
pub async fn save_session_pcm(pcm_path: &str, username: &str, pcm: &[u8]) -> std::io::Result<Option<PathBuf>> {
    if pcm.is_empty() {
        return Ok(None);
    }
    tokio::fs::create_dir_all(pcm_path).await?;

    let (date, time) = date_time_stamp();
    let safe_user: String = username
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let filename = format!("{date}_{safe_user}_{time}.pcm");
    let path = PathBuf::from(pcm_path).join(filename);

    tokio::fs::write(&path, pcm).await?;
    Ok(Some(path))
}

/// Returns `(YYYY-MM-DD, HH-MM-SS)` derived from the wall clock, with no
/// timezone database lookup — good enough for a filename stamp, not a log
/// timestamp (that's `logging.rs`'s job).
fn date_time_stamp() -> (String, String) {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let days = secs / 86_400;
    let time_of_day = secs % 86_400;
    let (hour, min, sec) = (time_of_day / 3600, (time_of_day % 3600) / 60, time_of_day % 60);

    // Civil-from-days (Howard Hinnant's algorithm), avoids a chrono dep for
    // a single filename stamp.
    let z = days as i64 + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    (
        format!("{y:04}-{m:02}-{d:02}"),
        format!("{hour:02}-{min:02}-{sec:02}"),
    )
}
