//! Crash-safe file replacement (temp file in the same directory, fsync, rename).

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::debug;

/// Atomically replace `path` with `contents`.
///
/// The temp file lives next to the target so the final rename never crosses a
/// filesystem. A crash at any point leaves either the old or the new file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;

    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    tmp.write_all(contents)
        .with_context(|| format!("write temp file for {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("fsync temp file for {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("replace {}", path.display()))?;
    sync_dir(parent);
    debug!(path = %path.display(), bytes = contents.len(), "atomic write");
    Ok(())
}

/// Serialize `value` as pretty JSON with a trailing newline and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

// Directory fsync makes the rename durable; not every platform allows it.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_existing_file_and_leaves_no_temp() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("record.json");
        write_atomic(&path, b"old").expect("first write");
        write_atomic(&path, b"new").expect("second write");
        assert_eq!(fs::read(&path).expect("read"), b"new");
        let entries: Vec<_> = fs::read_dir(path.parent().expect("parent"))
            .expect("read dir")
            .collect();
        assert_eq!(entries.len(), 1, "temp files must not linger");
    }

    /// A temp file abandoned mid-write never replaces the target.
    #[test]
    fn abandoned_temp_file_leaves_old_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("item.json");
        write_atomic(&path, b"{\"ok\":1}\n").expect("write");

        let mut tmp = NamedTempFile::new_in(temp.path()).expect("tmp");
        tmp.write_all(b"{\"ok\":").expect("partial");
        drop(tmp);

        assert_eq!(fs::read(&path).expect("read"), b"{\"ok\":1}\n");
    }

    #[test]
    fn json_has_trailing_newline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("v.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).expect("write");
        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.ends_with("}\n"));
    }
}
