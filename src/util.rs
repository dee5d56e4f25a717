use memmap2::Mmap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> io::Result<Mmap> {
    let file = File::open(path)?;
    // SAFETY: We only read from this mapping; callers hold the file unchanged.
    unsafe { Mmap::map(&file) }
}

/// Read a file through a mapping, or as an empty buffer for empty files
/// (which cannot be mapped on every platform). The closure sees the bytes
/// while the mapping is alive.
pub fn with_file_bytes<T>(path: &Path, f: impl FnOnce(&[u8]) -> T) -> io::Result<T> {
    if fs::metadata(path)?.len() == 0 {
        return Ok(f(&[]));
    }
    let map = mmap_file(path)?;
    Ok(f(&map))
}

/// Write `data` to a temporary sibling of `path`, then rename it into place.
pub fn write_via_temp(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = sibling_with_suffix(path, &format!(".tmp.{}", timestamp_millis()));
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// `path` with `suffix` appended to its final component.
pub fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

pub fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// Poll `condition` every `interval` until it holds or `timeout` elapses.
/// Returns whether the condition was observed.
pub fn wait_until(timeout: Duration, interval: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(interval);
    }
}
