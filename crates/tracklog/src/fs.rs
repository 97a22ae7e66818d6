//! Path layout and file-creation helpers shared by chunks and tracks.

use std::env;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::TrackResult;

/// Resolve the file path for the given id, relative to `root` when one is
/// provided and to the system temp directory otherwise.
pub(crate) fn resolve_path(root: Option<&Path>, id: &str) -> PathBuf {
    match root {
        Some(root) => root.join(id),
        None => env::temp_dir().join(id),
    }
}

/// File id of the `index`-th chunk belonging to a track.
pub(crate) fn chunk_file_id(track_id: &str, index: u64) -> String {
    format!("{track_id}{index}")
}

/// File id of a track's metadata fast-path file.
pub(crate) fn meta_file_id(track_id: &str) -> String {
    format!("{track_id}_meta")
}

/// Open (creating if needed) a chunk file and guarantee it is at least
/// `min_len` bytes long, so the header mapping never extends past
/// end-of-file.
pub(crate) fn open_chunk_file(path: &Path, min_len: u64) -> TrackResult<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    if file.metadata()?.len() < min_len {
        file.set_len(min_len)?;
    }
    Ok(file)
}

#[cfg(unix)]
pub(crate) fn page_size() -> u64 {
    // sysconf reports -1 on error; fall back to the common page size.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if raw > 0 { raw as u64 } else { 4096 }
}

#[cfg(not(unix))]
pub(crate) fn page_size() -> u64 {
    4096
}
