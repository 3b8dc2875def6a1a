//! Disk-backed file sources and download sinks.
//!
//! Downloads go to `<dir>/<name>.<fingerprint>.part` and are renamed into place on
//! close, so a crashed or aborted transfer never leaves a file that looks complete and
//! two downloads of the same name never share a part file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use meshdrop_core::{FileSource, Sink};
use tracing::{debug, error};

/// A shared local file, read chunk by chunk.
pub struct DiskFile {
    file: Mutex<File>,
    len: u64,
}

impl DiskFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            len,
        })
    }
}

impl FileSource for DiskFile {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "file lock poisoned"))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(len);
        Read::by_ref(&mut *file).take(len as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }
}

/// Reduce an announced file name to a safe final path component.
pub fn sanitize_name(name: &str) -> String {
    let last = name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim();
    match last {
        "" | "." | ".." => "download".to_string(),
        other => other.to_string(),
    }
}

/// First path in `dir` for `name` that does not exist yet: `name`, `name (1)`, ...
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    (1u32..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{} ({}).{}", stem, n, ext)),
            None => dir.join(format!("{} ({})", stem, n)),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Download sink writing to a `.part` file in the download directory.
pub struct DiskSink {
    dir: PathBuf,
    name: String,
    part_path: PathBuf,
    file: Option<File>,
}

impl DiskSink {
    /// Open a fresh part file for the download of `fingerprint`. Fails if that part file
    /// already exists, which means the same download is already running.
    pub fn create(dir: &Path, name: &str, fingerprint: &str) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let name = sanitize_name(name);
        let part_path = dir.join(format!("{}.{}.part", name, sanitize_name(fingerprint)));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part_path)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            name,
            part_path,
            file: Some(file),
        })
    }

    pub fn part_path(&self) -> &Path {
        &self.part_path
    }
}

impl Sink for DiskSink {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(f) => f.write_all(bytes),
            None => Err(io::Error::new(io::ErrorKind::Other, "sink already finished")),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        let Some(mut file) = self.file.take() else {
            return Err(io::Error::new(io::ErrorKind::Other, "sink already finished"));
        };
        file.flush()?;
        file.sync_all()?;
        drop(file);
        let target = unique_path(&self.dir, &self.name);
        fs::rename(&self.part_path, &target).map_err(|e| {
            error!(
                event = "download_rename_failure",
                from = %self.part_path.display(),
                to = %target.display(),
                error = %e,
                "Failed to move finished download into place"
            );
            e
        })?;
        debug!(event = "download_saved", path = %target.display(), "Download saved");
        Ok(())
    }

    fn abort(&mut self) {
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.part_path);
        }
    }
}

impl Drop for DiskSink {
    fn drop(&mut self) {
        self.abort();
    }
}
