//! Low-level POSIX shared memory operations

use crate::error::{Result, ShmPipeError};
use rustix::fd::OwnedFd;
use rustix::fs::ftruncate;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ptr::NonNull;

const SHM_PREFIX: &str = "/shmpipe_";

/// Handle to a mapped shared memory segment
pub struct ShmSegment {
    #[allow(dead_code)]
    fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    full_name: String,
    owner: bool,
    unlink_on_drop: bool,
}

// SAFETY: the mapping is plain bytes; all cross-process coordination inside
// it goes through atomic operations owned by the layers above.
unsafe impl Send for ShmSegment {}

impl ShmSegment {
    fn full_name(name: &str) -> String {
        format!("{}{}", SHM_PREFIX, name)
    }

    /// Create a new shared memory segment of `size` bytes.
    ///
    /// Creation is exclusive: if a segment with this name already exists the
    /// call fails with `AlreadyExists`, so two racing creators resolve to
    /// exactly one winner.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let full_name = Self::full_name(name);

        let fd = shm_open(
            full_name.as_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|e| ShmPipeError::from_os("shm_open", name, e))?;

        if let Err(e) = ftruncate(&fd, size as u64) {
            let _ = shm_unlink(full_name.as_str());
            return Err(ShmPipeError::from_os("ftruncate", name, e));
        }

        let addr = unsafe {
            match mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            ) {
                Ok(addr) => addr,
                Err(e) => {
                    let _ = shm_unlink(full_name.as_str());
                    return Err(ShmPipeError::from_os("mmap", name, e));
                }
            }
        };

        let addr = NonNull::new(addr.cast::<u8>()).ok_or(ShmPipeError::Malformed {
            reason: "mmap returned null",
        })?;

        Ok(Self {
            fd,
            addr,
            size,
            full_name,
            owner: true,
            unlink_on_drop: true,
        })
    }

    /// Open an existing shared memory segment.
    pub fn open(name: &str) -> Result<Self> {
        let full_name = Self::full_name(name);

        let fd = shm_open(full_name.as_str(), ShmOFlags::RDWR, Mode::empty())
            .map_err(|e| ShmPipeError::from_os("shm_open", name, e))?;

        let stat =
            rustix::fs::fstat(&fd).map_err(|e| ShmPipeError::from_os("fstat", name, e))?;
        let size = stat.st_size as usize;
        if size == 0 {
            return Err(ShmPipeError::Malformed {
                reason: "segment has zero size",
            });
        }

        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
            .map_err(|e| ShmPipeError::from_os("mmap", name, e))?
        };

        let addr = NonNull::new(addr.cast::<u8>()).ok_or(ShmPipeError::Malformed {
            reason: "mmap returned null",
        })?;

        Ok(Self {
            fd,
            addr,
            size,
            full_name,
            owner: false,
            unlink_on_drop: false,
        })
    }

    /// Get raw pointer to the mapping
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Get size of the mapping in bytes
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Check if this handle created (and therefore owns) the segment
    #[inline(always)]
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Control whether the name is unlinked when this handle drops.
    ///
    /// Only effective for the owning handle; openers never unlink.
    pub fn set_unlink_on_drop(&mut self, unlink: bool) {
        self.unlink_on_drop = unlink;
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }

        if self.owner && self.unlink_on_drop {
            let _ = shm_unlink(self.full_name.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_open() {
        let name = format!("test_seg_create_{}", std::process::id());
        let size = 4096;

        let seg1 = ShmSegment::create(&name, size).unwrap();
        assert!(seg1.is_owner());
        assert_eq!(seg1.size(), size);

        unsafe {
            std::ptr::write(seg1.as_ptr(), 42u8);
        }

        let seg2 = ShmSegment::open(&name).unwrap();
        assert!(!seg2.is_owner());

        let val = unsafe { std::ptr::read(seg2.as_ptr()) };
        assert_eq!(val, 42u8);

        drop(seg2);
        drop(seg1);

        // Owner dropped, name should be gone.
        match ShmSegment::open(&name) {
            Err(ShmPipeError::NotFound { .. }) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_exclusive_create() {
        let name = format!("test_seg_excl_{}", std::process::id());

        let _seg = ShmSegment::create(&name, 4096).unwrap();
        match ShmSegment::create(&name, 4096) {
            Err(ShmPipeError::AlreadyExists { name: n }) => assert_eq!(n, name),
            other => panic!("expected AlreadyExists, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_open_missing() {
        match ShmSegment::open("test_seg_never_created") {
            Err(ShmPipeError::NotFound { .. }) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_retain_on_drop() {
        let name = format!("test_seg_retain_{}", std::process::id());

        let mut seg = ShmSegment::create(&name, 4096).unwrap();
        seg.set_unlink_on_drop(false);
        drop(seg);

        // Name must still resolve; clean it up by re-arming an owner handle.
        let seg = ShmSegment::open(&name).unwrap();
        drop(seg);
        let _ = rustix::shm::shm_unlink(ShmSegment::full_name(&name).as_str());
    }
}
