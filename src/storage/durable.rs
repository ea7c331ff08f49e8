//! Crash-safe file publication.
//!
//! Every durable file (segment, manifest, pointer) is written to a sibling
//! temp file, optionally fsynced, then renamed over its final name. A reader
//! therefore sees either nothing or the complete file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::DurabilityMode;
use crate::error::Result;

/// Suffix of in-flight files. Anything carrying it is garbage after a crash.
pub const TMP_SUFFIX: &str = ".tmp";

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(TMP_SUFFIX);
    path.with_file_name(name)
}

/// Write `bytes` to `path` atomically.
pub fn write_atomic(path: &Path, bytes: &[u8], durability: DurabilityMode) -> Result<()> {
    let tmp = tmp_path(path);
    let result = (|| -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes)?;
        writer.flush()?;
        if durability == DurabilityMode::Strict {
            writer.get_ref().sync_all()?;
        }
        drop(writer);
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
thread_local! {
    static FAIL_DIR_SYNC: std::cell::RefCell<Option<PathBuf>> = const { std::cell::RefCell::new(None) };
}

/// Make `sync_dir` fail for `dir` on the calling thread until reset with
/// `None`.
#[cfg(test)]
pub(crate) fn fail_dir_sync(dir: Option<&Path>) {
    FAIL_DIR_SYNC.with(|slot| *slot.borrow_mut() = dir.map(Path::to_path_buf));
}

#[cfg(test)]
fn injected_sync_failure(dir: &Path) -> Result<()> {
    let fail = FAIL_DIR_SYNC.with(|slot| slot.borrow().as_deref() == Some(dir));
    if fail {
        return Err(std::io::Error::new(std::io::ErrorKind::Other, format!("sync of {} failed", dir.display())).into());
    }
    Ok(())
}

#[cfg(not(test))]
fn injected_sync_failure(_dir: &Path) -> Result<()> {
    Ok(())
}

/// fsync a directory so renames inside it are durable.
#[cfg(unix)]
pub fn sync_dir(dir: &Path, durability: DurabilityMode) -> Result<()> {
    injected_sync_failure(dir)?;
    if durability == DurabilityMode::Strict {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

/// Directory fsync is not available on this platform; NTFS journals
/// metadata on its own.
#[cfg(not(unix))]
pub fn sync_dir(dir: &Path, _durability: DurabilityMode) -> Result<()> {
    injected_sync_failure(dir)
}

/// Remove leftover temp files in `dir`. Returns how many were removed.
pub fn sweep_tmp_files(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    if !dir.exists() {
        return Ok(0);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_tmp = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(TMP_SUFFIX));
        if is_tmp && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
