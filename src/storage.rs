//! Upload storage module
//!
//! Owns the flat upload directory. Every accepted upload is streamed into a
//! hidden temp file next to its final location, synced, then renamed into
//! place, so a name in the directory always refers to a complete file.

use chrono::Utc;
use rand::Rng;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Exclusive upper bound of the random part of generated names
const RANDOM_SUFFIX_BOUND: u32 = 1_000_000_000;

/// Handle to the upload directory
#[derive(Debug, Clone)]
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    /// Create the directory when absent and return a handle to it.
    ///
    /// An existing directory is reused as is.
    pub async fn init(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Generate a collision-resistant name: `<unix-millis>-<random>.<extension>`
    pub fn generate_name(extension: &str) -> String {
        let millis = Utc::now().timestamp_millis();
        let suffix = rand::thread_rng().gen_range(0..RANDOM_SUFFIX_BOUND);
        format!("{millis}-{suffix}.{extension}")
    }

    /// Open a temp file that becomes `name` once [`PendingWrite::finish`] succeeds
    pub async fn begin(&self, name: &str) -> io::Result<PendingWrite> {
        let final_path = self.dir.join(name);
        let temp_path = self.dir.join(format!(".{name}.tmp"));
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await?;

        Ok(PendingWrite {
            file: Some(file),
            temp_path,
            final_path,
            bytes_written: 0,
            committed: false,
        })
    }
}

/// An upload being streamed to disk.
///
/// Dropping it before `finish` (client went away mid-body) removes the temp
/// file on the blocking pool.
#[derive(Debug)]
pub struct PendingWrite {
    file: Option<fs::File>,
    temp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
    committed: bool,
}

impl PendingWrite {
    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("write after close"))?;
        file.write_all(chunk).await?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    /// Flush to disk and move the temp file to its final name
    pub async fn finish(mut self) -> io::Result<u64> {
        if let Some(file) = self.file.take() {
            file.sync_all().await?;
        }
        fs::rename(&self.temp_path, &self.final_path).await?;
        self.committed = true;
        Ok(self.bytes_written)
    }

    /// Discard the temp file
    pub async fn abort(mut self) {
        drop(self.file.take());
        let _ = fs::remove_file(&self.temp_path).await;
        self.committed = true;
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        drop(self.file.take());
        let temp_path = std::mem::take(&mut self.temp_path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || std::fs::remove_file(temp_path));
            }
            Err(_) => {
                let _ = std::fs::remove_file(temp_path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn entries(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_init_creates_and_reuses_dir() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("uploads");

        let storage = Storage::init(&dir).await.unwrap();
        assert!(dir.is_dir());
        assert_eq!(storage.dir(), dir.as_path());

        std::fs::write(dir.join("keep.txt"), b"x").unwrap();
        Storage::init(&dir).await.unwrap();
        assert!(dir.join("keep.txt").exists());
    }

    #[tokio::test]
    async fn test_init_fails_on_regular_file() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("not-a-dir");
        std::fs::write(&path, b"x").unwrap();
        assert!(Storage::init(&path).await.is_err());
    }

    #[test]
    fn test_generate_name_format() {
        let name = Storage::generate_name("PNG");
        let (stem, ext) = name.rsplit_once('.').unwrap();
        assert_eq!(ext, "PNG");

        let (millis, suffix) = stem.split_once('-').unwrap();
        assert!(millis.parse::<i64>().unwrap() > 0);
        assert!(suffix.parse::<u32>().unwrap() < RANDOM_SUFFIX_BOUND);
    }

    #[test]
    fn test_generate_name_unique() {
        let names: HashSet<String> = (0..100).map(|_| Storage::generate_name("txt")).collect();
        assert_eq!(names.len(), 100);
    }

    #[tokio::test]
    async fn test_finish_renames_into_place() {
        let root = tempfile::tempdir().unwrap();
        let storage = Storage::init(root.path()).await.unwrap();

        let mut pending = storage.begin("a.txt").await.unwrap();
        pending.write(b"hello ").await.unwrap();
        pending.write(b"world").await.unwrap();
        assert_eq!(entries(root.path()), vec![".a.txt.tmp".to_string()]);

        let written = pending.finish().await.unwrap();
        assert_eq!(written, 11);
        assert_eq!(entries(root.path()), vec!["a.txt".to_string()]);
        assert_eq!(std::fs::read(root.path().join("a.txt")).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_abort_and_drop_leave_nothing() {
        let root = tempfile::tempdir().unwrap();
        let storage = Storage::init(root.path()).await.unwrap();

        let mut pending = storage.begin("a.txt").await.unwrap();
        pending.write(b"partial").await.unwrap();
        pending.abort().await;
        assert!(entries(root.path()).is_empty());

        let mut pending = storage.begin("b.txt").await.unwrap();
        pending.write(b"partial").await.unwrap();
        drop(pending);
        for _ in 0..100 {
            if entries(root.path()).is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(entries(root.path()).is_empty());
    }

    #[test]
    fn test_drop_outside_runtime_removes_temp() {
        let root = tempfile::tempdir().unwrap();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let pending = runtime.block_on(async {
            let storage = Storage::init(root.path()).await.unwrap();
            let mut pending = storage.begin("c.txt").await.unwrap();
            pending.write(b"partial").await.unwrap();
            pending
        });
        drop(pending);
        assert!(entries(root.path()).is_empty());
    }

    #[tokio::test]
    async fn test_begin_fails_without_directory() {
        let root = tempfile::tempdir().unwrap();
        let storage = Storage::init(root.path().join("gone")).await.unwrap();
        std::fs::remove_dir(storage.dir()).unwrap();
        assert!(storage.begin("a.txt").await.is_err());
    }
}
