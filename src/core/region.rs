//! Named shared-memory regions.
//!
//! A region is a file-backed mapping identified by a stable numeric key under
//! a root directory (normally on tmpfs, e.g. `/dev/shm/tradewinds`). Every
//! process that attaches the same key sees the same bytes. The region itself
//! offers no locking; callers coordinate through the atomics they project out
//! of it with [`Region::view`].

use std::io::ErrorKind;
use std::mem::{align_of, size_of};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64};

use crate::core::mmap::MmapFile;
use crate::core::{Error, Result};

/// Stable identifier of a region, shared by every attaching process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionKey(pub u32);

impl RegionKey {
    pub fn file_name(self) -> String {
        format!("tw-{:08x}.shm", self.0)
    }

    pub fn offset(self, by: u32) -> RegionKey {
        RegionKey(self.0.wrapping_add(by))
    }
}

/// Types that may be projected out of a shared region.
///
/// # Safety
///
/// Implementors must be valid when all bytes are zero, must only be mutated
/// through interior atomics, and must not contain pointers.
pub unsafe trait Shared: Sync {}

unsafe impl Shared for AtomicU32 {}
unsafe impl Shared for AtomicU64 {}
unsafe impl Shared for AtomicI64 {}

pub struct Region {
    key: RegionKey,
    path: PathBuf,
    map: MmapFile,
}

impl Region {
    pub fn create(root: &Path, key: RegionKey, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Allocation {
                key: key.0,
                reason: "cannot allocate 0 bytes",
            });
        }
        std::fs::create_dir_all(root)?;
        let path = root.join(key.file_name());
        let map = match MmapFile::create_new(&path, size) {
            Ok(map) => map,
            Err(Error::Io(err)) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::Allocation {
                    key: key.0,
                    reason: "key already in use",
                })
            }
            Err(err) => return Err(err),
        };
        log::debug!("created region {:#010x} ({} bytes)", key.0, size);
        Ok(Self { key, path, map })
    }

    pub fn attach(root: &Path, key: RegionKey) -> Result<Self> {
        let path = root.join(key.file_name());
        let map = match MmapFile::open(&path) {
            Ok(map) => map,
            Err(Error::Io(err)) if err.kind() == ErrorKind::NotFound => {
                return Err(Error::Attach {
                    key: key.0,
                    reason: "no such region",
                })
            }
            Err(Error::InvalidArgument(_)) => {
                return Err(Error::Attach {
                    key: key.0,
                    reason: "region is empty",
                })
            }
            Err(err) => return Err(err),
        };
        Ok(Self { key, path, map })
    }

    /// Removes the backing object. Mappings held by other processes stay
    /// valid until they detach.
    pub fn destroy(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(&path)?;
        Ok(())
    }

    pub fn destroy_key(root: &Path, key: RegionKey) -> Result<()> {
        match std::fs::remove_file(root.join(key.file_name())) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn key(&self) -> RegionKey {
        self.key
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn read(&self) -> &[u8] {
        self.map.as_slice()
    }

    /// Copies `data` to the start of the region. Oversized or empty writes are
    /// skipped with a diagnostic and report `false`.
    pub fn write(&mut self, data: &[u8]) -> bool {
        if data.is_empty() {
            log::warn!("region {:#010x}: refusing empty write", self.key.0);
            return false;
        }
        if data.len() > self.map.len() {
            log::warn!(
                "region {:#010x}: write of {} bytes exceeds reserved {}",
                self.key.0,
                data.len(),
                self.map.len()
            );
            return false;
        }
        self.map.as_mut_slice()[..data.len()].copy_from_slice(data);
        true
    }

    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len())
            .ok_or(Error::Corrupt("range overflow"))?;
        if end > self.map.len() {
            return Err(Error::Corrupt("range out of bounds"));
        }
        self.map.as_mut_slice()[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Projects `count` values of `T` starting at byte `offset`.
    pub fn view<T: Shared>(&self, offset: usize, count: usize) -> Result<&[T]> {
        let bytes = count
            .checked_mul(size_of::<T>())
            .and_then(|len| len.checked_add(offset))
            .ok_or(Error::Corrupt("view overflow"))?;
        if bytes > self.map.len() {
            return Err(Error::Corrupt("view out of bounds"));
        }
        let ptr = unsafe { self.map.as_ptr().add(offset) };
        if (ptr as usize) % align_of::<T>() != 0 {
            return Err(Error::Corrupt("misaligned view"));
        }
        // SAFETY: bounds and alignment checked above; `Shared` types are valid
        // for any bit pattern we write and only mutate through atomics.
        Ok(unsafe { std::slice::from_raw_parts(ptr as *const T, count) })
    }
}

/// Rounds `offset` up to the alignment of `T`.
pub fn align_for<T>(offset: usize) -> usize {
    let align = align_of::<T>();
    (offset + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn create_rejects_duplicate_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _first = Region::create(dir.path(), RegionKey(7), 64).expect("create");
        let err = Region::create(dir.path(), RegionKey(7), 64).err().expect("duplicate");
        assert!(matches!(err, Error::Allocation { key: 7, .. }));
    }

    #[test]
    fn create_rejects_zero_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Region::create(dir.path(), RegionKey(1), 0).err().expect("zero");
        assert!(matches!(err, Error::Allocation { .. }));
    }

    #[test]
    fn attach_missing_key_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Region::attach(dir.path(), RegionKey(9)).err().expect("missing");
        assert!(matches!(err, Error::Attach { key: 9, .. }));
    }

    #[test]
    fn oversized_write_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut region = Region::create(dir.path(), RegionKey(2), 8).expect("create");
        assert!(!region.write(&[1u8; 9]));
        assert!(!region.write(&[]));
        assert_eq!(region.read(), &[0u8; 8]);
        assert!(region.write(&[5u8; 4]));
        assert_eq!(&region.read()[..4], &[5u8; 4]);
    }

    #[test]
    fn attached_views_share_memory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let owner = Region::create(dir.path(), RegionKey(3), 64).expect("create");
        let other = Region::attach(dir.path(), RegionKey(3)).expect("attach");

        let a = owner.view::<AtomicU64>(8, 2).expect("view");
        let b = other.view::<AtomicU64>(8, 2).expect("view");
        a[1].store(42, Ordering::Release);
        assert_eq!(b[1].load(Ordering::Acquire), 42);

        assert!(owner.view::<AtomicU64>(8, 8).is_err());
        assert!(owner.view::<AtomicU64>(4, 1).is_err());
    }

    #[test]
    fn destroy_removes_backing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let region = Region::create(dir.path(), RegionKey(4), 16).expect("create");
        region.destroy().expect("destroy");
        assert!(Region::attach(dir.path(), RegionKey(4)).is_err());
        Region::destroy_key(dir.path(), RegionKey(4)).expect("idempotent");
    }
}
