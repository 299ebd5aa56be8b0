use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static ATOMIC_COUNTER: AtomicU64 = AtomicU64::new(0);
pub(crate) const TEMP_PREFIX: &str = ".dws.tmp.";

/// A temp file next to its destination. Dropping it without `commit` removes it.
struct PendingFile {
    tmp_path: PathBuf,
    file: Option<File>,
    committed: bool,
}

impl PendingFile {
    fn create(target: &Path) -> io::Result<Self> {
        let parent = parent_dir(target)?;
        fs::create_dir_all(parent)?;
        let tmp_path = temp_path_in_parent(parent, target)?;
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)?;
        Ok(Self {
            tmp_path,
            file: Some(file),
            committed: false,
        })
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(bytes),
            None => Err(io::Error::other("pending file already closed")),
        }
    }

    fn commit(mut self, target: &Path) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.sync_all()?;
        }
        rename_overwrite(&self.tmp_path, target)?;
        self.committed = true;
        sync_parent_dir(parent_dir(target)?)
    }
}

impl Drop for PendingFile {
    fn drop(&mut self) {
        if !self.committed {
            self.file.take();
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

/// Replaces `path` with `bytes`, never leaving a partially written file behind.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut pending = PendingFile::create(path)?;
    pending.write_all(bytes)?;
    pending.commit(path)
}

/// Copies `from` over `to` through the same temp-file-and-rename path.
pub fn atomic_copy(from: &Path, to: &Path) -> io::Result<()> {
    let bytes = fs::read(from)?;
    atomic_write(to, &bytes)
}

fn parent_dir(path: &Path) -> io::Result<&Path> {
    match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => Ok(Path::new(".")),
        Some(parent) => Ok(parent),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path `{}` has no parent directory", path.display()),
        )),
    }
}

fn rename_overwrite(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) => {
            if to.exists() {
                fs::remove_file(to)?;
                fs::rename(from, to)
            } else {
                Err(err)
            }
        }
    }
}

#[cfg(unix)]
fn sync_parent_dir(parent: &Path) -> io::Result<()> {
    File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_parent: &Path) -> io::Result<()> {
    Ok(())
}

fn temp_path_in_parent(parent: &Path, final_path: &Path) -> io::Result<PathBuf> {
    let file_name = final_path
        .file_name()
        .and_then(|value| value.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid target filename"))?;
    let epoch_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|err| io::Error::other(err.to_string()))?
        .as_nanos();
    let counter = ATOMIC_COUNTER.fetch_add(1, Ordering::Relaxed);
    Ok(parent.join(format!(
        "{TEMP_PREFIX}{file_name}.{epoch_nanos}.{}.{counter}",
        std::process::id()
    )))
}
