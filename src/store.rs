use std::io::SeekFrom;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::SwarmError;

/// Byte storage for the shared file.
///
/// `write` returning `Ok` is the durability signal the assembler waits
/// for before announcing a finished piece; implementations must not
/// acknowledge before the bytes are safely handed off.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Read the byte range `[start, end)`.
    async fn read(&self, start: u64, end: u64) -> Result<Bytes, SwarmError>;

    /// Write `data` starting at byte `offset`.
    async fn write(&self, data: Bytes, offset: u64) -> Result<(), SwarmError>;
}

/// Fixed-size in-memory backend.
pub struct MemoryStore {
    buf: Mutex<Vec<u8>>,
}

impl MemoryStore {
    pub fn new(size: u64) -> Self {
        Self {
            buf: Mutex::new(vec![0; size as usize]),
        }
    }

    /// Pre-filled store, for the serving side of a transfer.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            buf: Mutex::new(data.into()),
        }
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.buf.lock().expect("store mutex poisoned").clone()
    }
}

#[async_trait]
impl BlockStore for MemoryStore {
    async fn read(&self, start: u64, end: u64) -> Result<Bytes, SwarmError> {
        let buf = self.buf.lock().expect("store mutex poisoned");
        let (start, end) = (start as usize, end as usize);
        if start > end || end > buf.len() {
            return Err(SwarmError::StorageError(format!(
                "read range {}..{} outside store of {} bytes",
                start,
                end,
                buf.len()
            )));
        }
        Ok(Bytes::copy_from_slice(&buf[start..end]))
    }

    async fn write(&self, data: Bytes, offset: u64) -> Result<(), SwarmError> {
        let mut buf = self.buf.lock().expect("store mutex poisoned");
        let offset = offset as usize;
        let end = offset + data.len();
        if end > buf.len() {
            return Err(SwarmError::StorageError(format!(
                "write range {}..{} outside store of {} bytes",
                offset,
                end,
                buf.len()
            )));
        }
        buf[offset..end].copy_from_slice(&data);
        Ok(())
    }
}

/// Pre-sized on-disk backend with positional reads and writes.
pub struct FileStore {
    file: tokio::sync::Mutex<File>,
    size: u64,
}

impl FileStore {
    /// Creates (or truncates) the backing file and sizes it up front.
    pub async fn create(path: impl AsRef<Path>, size: u64) -> Result<Self, SwarmError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await
            .map_err(|e| SwarmError::StorageError(format!("{}", e)))?;
        file.set_len(size)
            .await
            .map_err(|e| SwarmError::StorageError(format!("{}", e)))?;
        Ok(Self {
            file: tokio::sync::Mutex::new(file),
            size,
        })
    }

    /// Opens an existing file, e.g. one being seeded.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SwarmError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await
            .map_err(|e| SwarmError::StorageError(format!("{}", e)))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| SwarmError::StorageError(format!("{}", e)))?
            .len();
        Ok(Self {
            file: tokio::sync::Mutex::new(file),
            size,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

#[async_trait]
impl BlockStore for FileStore {
    async fn read(&self, start: u64, end: u64) -> Result<Bytes, SwarmError> {
        if start > end || end > self.size {
            return Err(SwarmError::StorageError(format!(
                "read range {}..{} outside store of {} bytes",
                start, end, self.size
            )));
        }
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| SwarmError::StorageError(format!("{}", e)))?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| SwarmError::StorageError(format!("{}", e)))?;
        Ok(Bytes::from(buf))
    }

    async fn write(&self, data: Bytes, offset: u64) -> Result<(), SwarmError> {
        if offset + data.len() as u64 > self.size {
            return Err(SwarmError::StorageError(format!(
                "write range {}..{} outside store of {} bytes",
                offset,
                offset + data.len() as u64,
                self.size
            )));
        }
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| SwarmError::StorageError(format!("{}", e)))?;
        file.write_all(&data)
            .await
            .map_err(|e| SwarmError::StorageError(format!("{}", e)))?;
        file.flush()
            .await
            .map_err(|e| SwarmError::StorageError(format!("{}", e)))
    }
}
