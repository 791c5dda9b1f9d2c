use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

static TEMP_FILE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Writes text using a temp file + fsync + rename so readers never observe partial data.
///
/// The temporary file lives next to `path` (same filesystem, so the rename is
/// atomic) and carries a leading dot plus a `.tmp-` marker that directory
/// scanners can skip.
pub fn write_text_atomic(path: &Path, content: &str) -> io::Result<()> {
    if path.as_os_str().is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "destination path cannot be empty",
        ));
    }
    if path.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("destination path '{}' is a directory", path.display()),
        ));
    }

    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent_dir)?;

    let temp_name = format!(
        ".{}.tmp-{}-{}",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("record"),
        std::process::id(),
        TEMP_FILE_COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let temp_path = parent_dir.join(temp_name);
    let written =
        write_and_sync(&temp_path, content).and_then(|()| std::fs::rename(&temp_path, path));
    if let Err(error) = written {
        let _ = std::fs::remove_file(&temp_path);
        return Err(error);
    }
    sync_directory(parent_dir);
    Ok(())
}

/// Returns true when `file_name` looks like a temp file produced by [`write_text_atomic`].
pub fn is_atomic_temp_file_name(file_name: &str) -> bool {
    file_name.starts_with('.') && file_name.contains(".tmp-")
}

fn write_and_sync(path: &Path, content: &str) -> io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()
}

#[cfg(unix)]
fn sync_directory(dir: &Path) {
    if let Ok(handle) = std::fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::{is_atomic_temp_file_name, write_text_atomic};

    #[test]
    fn unit_write_text_atomic_replaces_existing_content_without_leftovers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("metadata.json");
        write_text_atomic(&path, "{\"v\":1}").expect("first write");
        write_text_atomic(&path, "{\"v\":2}").expect("second write");

        assert_eq!(std::fs::read_to_string(&path).expect("read"), "{\"v\":2}");
        let leftovers = std::fs::read_dir(temp.path())
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| is_atomic_temp_file_name(&entry.file_name().to_string_lossy()))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn regression_write_text_atomic_rejects_directory_destination() {
        let temp = tempfile::tempdir().expect("tempdir");
        let error = write_text_atomic(temp.path(), "x").expect_err("directory target");
        assert_eq!(error.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn unit_temp_file_names_are_recognized() {
        assert!(is_atomic_temp_file_name(".metadata.json.tmp-42-7"));
        assert!(!is_atomic_temp_file_name("metadata.json"));
    }
}
