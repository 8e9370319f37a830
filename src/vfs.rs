//! Virtual filesystem seam.
//!
//! All engine I/O goes through `Arc<dyn Vfs>` so that recovery and
//! corruption paths can be exercised against an in-memory double
//! without touching the real disk. `DiskFs` is the production
//! implementation; `MemFs` backs tests.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use crate::error::Result;

pub trait Vfs: Send + Sync {
    /// Create or truncate a file and write `data` to it.
    fn write_all(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Append `data` to a file, creating it if absent.
    fn append(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Read the whole file.
    fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Read exactly `buf.len()` bytes at `offset`.
    fn read_at(&self, path: &Path, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn len(&self, path: &Path) -> Result<u64>;

    fn truncate(&self, path: &Path, len: u64) -> Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    fn unlink(&self, path: &Path) -> Result<()>;

    fn mkdir_all(&self, path: &Path) -> Result<()>;

    fn exists(&self, path: &Path) -> bool;

    /// File names (not full paths) directly under `path`.
    fn read_dir(&self, path: &Path) -> Result<Vec<String>>;

    /// Durably sync file contents.
    fn sync(&self, path: &Path) -> Result<()>;

    /// Durably sync a directory entry table, making prior renames and
    /// unlinks under `path` survive power loss.
    fn sync_dir(&self, path: &Path) -> Result<()>;
}

/// Production filesystem backed by `std::fs`.
pub struct DiskFs;

impl Vfs for DiskFs {
    fn write_all(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut file = fs::File::create(path)?;
        file.write_all(data)?;
        Ok(())
    }

    fn append(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(data)?;
        Ok(())
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(path)?)
    }

    fn read_at(&self, path: &Path, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = fs::File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn len(&self, path: &Path) -> Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn truncate(&self, path: &Path, len: u64) -> Result<()> {
        let file = fs::OpenOptions::new().write(true).open(path)?;
        file.set_len(len)?;
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        Ok(fs::rename(from, to)?)
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        Ok(fs::remove_file(path)?)
    }

    fn mkdir_all(&self, path: &Path) -> Result<()> {
        Ok(fs::create_dir_all(path)?)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    fn sync(&self, path: &Path) -> Result<()> {
        let file = fs::File::open(path)?;
        file.sync_all()?;
        Ok(())
    }

    fn sync_dir(&self, path: &Path) -> Result<()> {
        let dir = fs::File::open(path)?;
        dir.sync_all()?;
        Ok(())
    }
}

/// In-memory filesystem double for tests.
///
/// Files are byte vectors under normalized paths; directories exist
/// implicitly once created. Sync is a no-op.
#[derive(Default)]
pub struct MemFs {
    files: RwLock<HashMap<PathBuf, Mutex<Vec<u8>>>>,
    dirs: RwLock<Vec<PathBuf>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(path: &Path) -> crate::Error {
        io::Error::new(io::ErrorKind::NotFound, format!("{}", path.display())).into()
    }
}

impl Vfs for MemFs {
    fn write_all(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.files
            .write()
            .unwrap()
            .insert(path.to_path_buf(), Mutex::new(data.to_vec()));
        Ok(())
    }

    fn append(&self, path: &Path, data: &[u8]) -> Result<()> {
        let files = self.files.read().unwrap();
        if let Some(file) = files.get(path) {
            file.lock().unwrap().extend_from_slice(data);
            return Ok(());
        }
        drop(files);
        self.write_all(path, data)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let files = self.files.read().unwrap();
        let file = files.get(path).ok_or_else(|| Self::not_found(path))?;
        let data = file.lock().unwrap().clone();
        Ok(data)
    }

    fn read_at(&self, path: &Path, offset: u64, buf: &mut [u8]) -> Result<()> {
        let files = self.files.read().unwrap();
        let file = files.get(path).ok_or_else(|| Self::not_found(path))?;
        let data = file.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read past end of {}", path.display()),
            )
            .into());
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn len(&self, path: &Path) -> Result<u64> {
        let files = self.files.read().unwrap();
        let file = files.get(path).ok_or_else(|| Self::not_found(path))?;
        let len = file.lock().unwrap().len();
        Ok(len as u64)
    }

    fn truncate(&self, path: &Path, len: u64) -> Result<()> {
        let files = self.files.read().unwrap();
        let file = files.get(path).ok_or_else(|| Self::not_found(path))?;
        file.lock().unwrap().truncate(len as usize);
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut files = self.files.write().unwrap();
        let file = files.remove(from).ok_or_else(|| Self::not_found(from))?;
        files.insert(to.to_path_buf(), file);
        Ok(())
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        let mut files = self.files.write().unwrap();
        files.remove(path).ok_or_else(|| Self::not_found(path))?;
        Ok(())
    }

    fn mkdir_all(&self, path: &Path) -> Result<()> {
        let mut dirs = self.dirs.write().unwrap();
        if !dirs.iter().any(|d| d == path) {
            dirs.push(path.to_path_buf());
        }
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.read().unwrap().contains_key(path)
            || self.dirs.read().unwrap().iter().any(|d| d == path)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<String>> {
        let files = self.files.read().unwrap();
        let mut names: Vec<String> = files
            .keys()
            .filter(|p| p.parent() == Some(path))
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
            .collect();
        names.sort();
        Ok(names)
    }

    fn sync(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn sync_dir(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}
