//! Shared persistence utilities: atomic file writes and file copies.

use std::io;
use std::path::{Path, PathBuf};

/// Sibling path used for the in-flight write (`model.bin` -> `model.bin.tmp`).
fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomically write raw bytes to a file.
///
/// Writes to a `.tmp` sibling file, then renames onto the target path.
/// Creates parent directories if they don't exist.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = tmp_path(path);
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Copy `src` into `dest_dir`, keeping its file name. Returns the destination path.
pub fn copy_into_dir(src: &Path, dest_dir: &Path) -> io::Result<PathBuf> {
    let file_name = src.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", src.display()),
        )
    })?;
    std::fs::create_dir_all(dest_dir)?;
    let dest = dest_dir.join(file_name);
    let data = std::fs::read(src)?;
    atomic_write(&dest, &data)?;
    Ok(dest)
}
