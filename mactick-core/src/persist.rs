//! XPRAM file storage

use crate::error::TimingResult;
use crate::watchdog::{PersistSink, WatchedBuffer};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Stores the watched buffer as a raw file.
#[derive(Debug, Clone)]
pub struct XpramFile {
    path: PathBuf,
}

impl XpramFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fill `buffer` from the file.
    ///
    /// A missing file leaves the buffer untouched and returns false. A short
    /// file zeroes the remainder; extra bytes are ignored.
    pub fn load_into(&self, buffer: &WatchedBuffer) -> TimingResult<bool> {
        if !self.path.exists() {
            debug!("No XPRAM file at {:?}", self.path);
            return Ok(false);
        }

        let data = std::fs::read(&self.path)?;
        let mut image = vec![0u8; buffer.len()];
        let len = data.len().min(image.len());
        image[..len].copy_from_slice(&data[..len]);
        buffer.write(0, &image);

        info!("Loaded XPRAM from {:?} ({} bytes)", self.path, data.len());
        Ok(true)
    }
}

impl PersistSink for XpramFile {
    fn persist(&self, data: &[u8]) -> TimingResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, data)?;
        Ok(())
    }
}
