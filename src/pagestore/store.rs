use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::DefragError;
use crate::types::DefragResult;

/// Read/write fixed-size pages to a file, allocate new page indices,
/// `sync()`. This is C1, an external interface in the system this
/// engine belongs to — the surrounding runtime owns the real
/// implementation; `FilePageStore` below is this crate's standalone
/// stand-in, used both by tests and by a bare embedding.
pub trait PageStore: Send + Sync {
    fn page_size(&self) -> usize;

    /// Number of pages currently allocated in this store.
    fn page_count(&self) -> u32;

    fn read_page(&self, index: u32) -> DefragResult<Vec<u8>>;

    fn write_page(&self, index: u32, data: &[u8]) -> DefragResult<()>;

    /// Allocate a fresh page index at the end of the store and zero it.
    fn allocate(&self) -> DefragResult<u32>;

    fn sync(&self) -> DefragResult<()>;
}

struct Inner {
    file: File,
    page_count: u32,
}

/// A single-file, fixed-page-size store. Mirrors the teacher's
/// `SmallFile`/`BTreeTable::file_init` pattern: pages are laid out
/// back-to-back starting at offset 0, created empty and grown by
/// `allocate`.
pub struct FilePageStore {
    path: PathBuf,
    page_size: usize,
    inner: Mutex<Inner>,
}

impl FilePageStore {
    /// Create a brand-new, empty page store at `path`. Fails if the file
    /// already exists and is non-empty — callers that want to resume an
    /// existing store should use [`FilePageStore::open`].
    pub fn create(path: impl AsRef<Path>, page_size: usize) -> DefragResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        Ok(Self {
            path,
            page_size,
            inner: Mutex::new(Inner {
                file,
                page_count: 0,
            }),
        })
    }

    /// Open an existing page store, inferring `page_count` from the file
    /// length. Used when resuming a partially-built `.tmp` file, or when
    /// reopening a mapping store after a crash (`init = false` for the
    /// Link Map, §4.3).
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> DefragResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len % page_size as u64 != 0 {
            return Err(DefragError::page_io(format!(
                "page store {:?} has length {} not a multiple of page size {}",
                path, len, page_size
            )));
        }
        let page_count = (len / page_size as u64) as u32;

        Ok(Self {
            path,
            page_size,
            inner: Mutex::new(Inner { file, page_count }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PageStore for FilePageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> u32 {
        self.inner.lock().unwrap().page_count
    }

    fn read_page(&self, index: u32) -> DefragResult<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        if index >= inner.page_count {
            return Err(DefragError::page_io(format!(
                "read_page: index {} out of range (page_count = {})",
                index, inner.page_count
            )));
        }
        let offset = index as u64 * self.page_size as u64;
        inner.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; self.page_size];
        inner.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_page(&self, index: u32, data: &[u8]) -> DefragResult<()> {
        if data.len() != self.page_size {
            return Err(DefragError::page_io(format!(
                "write_page: expected {} bytes, got {}",
                self.page_size,
                data.len()
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        if index >= inner.page_count {
            return Err(DefragError::page_io(format!(
                "write_page: index {} out of range (page_count = {})",
                index, inner.page_count
            )));
        }
        let offset = index as u64 * self.page_size as u64;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(data)?;
        Ok(())
    }

    fn allocate(&self) -> DefragResult<u32> {
        let mut inner = self.inner.lock().unwrap();
        let index = inner.page_count;
        let offset = index as u64 * self.page_size as u64;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&vec![0u8; self.page_size])?;
        inner.page_count += 1;
        Ok(index)
    }

    fn sync(&self) -> DefragResult<()> {
        let inner = self.inner.lock().unwrap();
        inner.file.sync_all()?;
        Ok(())
    }
}
