//! File-backed host bindings.
//!
//! Lets the label reader and everything above it run against a disk
//! image instead of live media. Used by the integration tests and handy
//! for poking at an image copied off real hardware.

use crate::host::{BlockDevice, HostError, MediaReader};
use std::fs;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// A read-only block device backed by a regular file.
#[derive(Debug)]
pub struct FileMedia {
    path: PathBuf,
    size: u64,
    bsd_name: Option<String>,
    media_uuid: Option<String>,
    leaf: bool,
}

impl FileMedia {
    /// Open `path` and snapshot its current size as the device size.
    pub fn open(path: impl AsRef<Path>, bsd_name: &str) -> io::Result<FileMedia> {
        let path = path.as_ref().to_path_buf();
        let metadata = fs::metadata(&path)?;
        Ok(FileMedia {
            path,
            size: metadata.len(),
            bsd_name: Some(bsd_name.to_string()),
            media_uuid: None,
            leaf: true,
        })
    }

    pub fn with_uuid(mut self, uuid: &str) -> Self {
        self.media_uuid = Some(uuid.to_string());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileMedia {
    fn byte_size(&self) -> u64 {
        self.size
    }

    fn is_leaf(&self) -> bool {
        self.leaf
    }

    fn bsd_name(&self) -> Option<String> {
        self.bsd_name.clone()
    }

    fn media_uuid(&self) -> Option<String> {
        self.media_uuid.clone()
    }

    fn open_readonly(&self) -> Result<Box<dyn MediaReader + '_>, HostError> {
        let file = fs::OpenOptions::new().read(true).open(&self.path)?;
        Ok(Box::new(FileReader { file }))
    }
}

struct FileReader {
    file: fs::File,
}

impl MediaReader for FileReader {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, HostError> {
        let mut done = 0;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(HostError::Io(err)),
            }
        }
        Ok(done)
    }
}
