use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::core::{Error, Result};

pub struct MmapFile {
    _file: File,
    map: MmapMut,
    len: usize,
}

impl MmapFile {
    /// Creates the backing file exclusively; an existing file is an error.
    pub fn create_new(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidArgument("mmap length must be non-zero".into()));
        }
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self {
            _file: file,
            map,
            len,
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::InvalidArgument("mmap length must be non-zero".into()));
        }
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self {
            _file: file,
            map,
            len,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
