//! Named POSIX shared memory segments

use crate::error::{BridgeError, Result};
use crate::uid;
use rustix::fd::OwnedFd;
use rustix::fs::ftruncate;
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::ptr::NonNull;

/// Prefix used when `create` is asked to generate a name itself
const GENERATED_NAME_PREFIX: &str = "pshm_";

/// POSIX shm names live in a single path component; leave room for the
/// leading slash the OS namespace requires
const MAX_NAME_LEN: usize = 254;

#[derive(Debug)]
struct Mapping {
    #[allow(dead_code)]
    fd: OwnedFd,
    addr: NonNull<u8>,
    len: usize,
}

/// RAII handle to one named shared memory segment.
///
/// `create` allocates and maps a new region; `open` attaches to an
/// existing one. Dropping the handle unmaps it. The name stays in the
/// OS namespace until the owning side calls [`ShmSegment::unlink`].
#[derive(Debug)]
pub struct ShmSegment {
    name: String,
    mapping: Option<Mapping>,
}

// SAFETY: the handle only carries the mapped range; synchronization of
// the bytes themselves is the caller's contract (control-channel barrier)
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

fn os_name(name: &str) -> Result<CString> {
    if name.len() > MAX_NAME_LEN {
        return Err(BridgeError::InvalidArgument(format!(
            "shared memory name too long: max {} chars, got {}",
            MAX_NAME_LEN,
            name.len()
        )));
    }
    CString::new(format!("/{name}")).map_err(|_| {
        BridgeError::InvalidArgument(format!("shared memory name contains NUL: {name:?}"))
    })
}

fn map_fd(fd: OwnedFd, len: usize, name: &str) -> Result<Mapping> {
    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            &fd,
            0,
        )
        .map_err(|e| BridgeError::AllocationFailed {
            name: name.to_string(),
            source: e.into(),
        })?
    };
    let addr = NonNull::new(addr.cast::<u8>()).ok_or_else(|| BridgeError::AllocationFailed {
        name: name.to_string(),
        source: std::io::Error::other("mmap returned null"),
    })?;
    Ok(Mapping { fd, addr, len })
}

impl ShmSegment {
    /// Create a new segment of `size` bytes and map it.
    ///
    /// An empty `name` asks the bridge to generate one (fixed prefix plus
    /// a fresh identifier). Creation is exclusive: a name that already
    /// exists fails with `AllocationFailed`.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(BridgeError::InvalidArgument(
                "shared memory size must be > 0".into(),
            ));
        }

        let name = if name.is_empty() {
            format!("{}{}", GENERATED_NAME_PREFIX, uid::new_id())
        } else {
            name.to_string()
        };
        let c_name = os_name(&name)?;

        let fd = shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP,
        )
        .map_err(|e| BridgeError::AllocationFailed {
            name: name.clone(),
            source: e.into(),
        })?;

        if let Err(e) = ftruncate(&fd, size as u64) {
            // Creation half-done: take the name back out of the namespace
            let _ = shm_unlink(c_name.as_c_str());
            return Err(BridgeError::AllocationFailed {
                name,
                source: e.into(),
            });
        }

        let mapping = match map_fd(fd, size, &name) {
            Ok(m) => m,
            Err(e) => {
                let _ = shm_unlink(c_name.as_c_str());
                return Err(e);
            }
        };

        tracing::debug!(name = %name, size, "created shared memory segment");
        Ok(Self {
            name,
            mapping: Some(mapping),
        })
    }

    /// Attach to an existing segment by name, mapping its full size.
    pub fn open(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(BridgeError::InvalidArgument(
                "shared memory name required when opening".into(),
            ));
        }
        let c_name = os_name(name)?;

        let fd = shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(|e| {
            if e == Errno::NOENT {
                BridgeError::NotFound(format!("shared memory segment '{name}'"))
            } else {
                BridgeError::AllocationFailed {
                    name: name.to_string(),
                    source: e.into(),
                }
            }
        })?;

        let stat = rustix::fs::fstat(&fd).map_err(|e| BridgeError::AllocationFailed {
            name: name.to_string(),
            source: e.into(),
        })?;
        let size = stat.st_size as usize;
        if size == 0 {
            return Err(BridgeError::AllocationFailed {
                name: name.to_string(),
                source: std::io::Error::other("segment has zero size"),
            });
        }

        let mapping = map_fd(fd, size, name)?;

        tracing::debug!(name = %name, size, "opened shared memory segment");
        Ok(Self {
            name: name.to_string(),
            mapping: Some(mapping),
        })
    }

    /// Combined create/open, kept for thin wrapper layers that surface a
    /// single entry point with a mode flag. Both error paths stay distinct.
    pub fn create_or_open(name: &str, size: usize, create_mode: bool) -> Result<Self> {
        if create_mode {
            Self::create(name, size)
        } else {
            Self::open(name)
        }
    }

    /// Unmap and release local resources. Idempotent, never fails.
    ///
    /// Other processes attached to the same name are unaffected.
    pub fn close(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            unsafe {
                let _ = munmap(mapping.addr.as_ptr().cast(), mapping.len);
            }
        }
    }

    /// Remove the stored name from the OS-wide namespace.
    ///
    /// Safe on a closed handle. Existing mappings (here or in other
    /// processes) stay valid until they unmap; only future `open` calls
    /// stop finding the name. Errors (already unlinked, never created)
    /// are swallowed.
    pub fn unlink(&self) {
        if self.name.is_empty() {
            return;
        }
        if let Ok(c_name) = os_name(&self.name) {
            let _ = shm_unlink(c_name.as_c_str());
        }
    }

    /// Whether the local mapping has been released
    pub fn is_closed(&self) -> bool {
        self.mapping.is_none()
    }

    /// The segment's name (without the OS namespace slash)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mapped length in bytes; 0 when closed
    pub fn size(&self) -> usize {
        self.mapping.as_ref().map_or(0, |m| m.len)
    }

    /// Base address of the mapping; null when closed
    pub fn address(&self) -> *mut u8 {
        self.mapping
            .as_ref()
            .map_or(std::ptr::null_mut(), |m| m.addr.as_ptr())
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("pivot_test_{}_{}", tag, uid::new_id())
    }

    #[test]
    fn test_create_reports_requested_size() {
        let name = unique_name("size");
        let seg = ShmSegment::create(&name, 4096).unwrap();
        assert_eq!(seg.size(), 4096);
        assert!(!seg.is_closed());
        assert!(!seg.address().is_null());
        seg.unlink();
    }

    #[test]
    fn test_create_generates_prefixed_name() {
        let seg = ShmSegment::create("", 64).unwrap();
        assert!(seg.name().starts_with(GENERATED_NAME_PREFIX));
        assert_eq!(seg.name().len(), GENERATED_NAME_PREFIX.len() + uid::ID_LEN);
        seg.unlink();
    }

    #[test]
    fn test_create_zero_size_rejected() {
        let err = ShmSegment::create("whatever", 0).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));
    }

    #[test]
    fn test_open_empty_name_rejected() {
        let err = ShmSegment::open("").unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let name = unique_name("close");
        let mut seg = ShmSegment::create(&name, 128).unwrap();
        seg.close();
        assert!(seg.is_closed());
        assert_eq!(seg.size(), 0);
        assert!(seg.address().is_null());
        seg.close();
        assert!(seg.is_closed());
        seg.unlink();
    }

    #[test]
    fn test_second_attacher_sees_creator_size() {
        let name = unique_name("attach");
        let creator = ShmSegment::create(&name, 8192).unwrap();

        // Write through the creator's mapping
        unsafe {
            std::ptr::write(creator.address(), 42u8);
        }

        let attacher = ShmSegment::open(&name).unwrap();
        assert_eq!(attacher.size(), 8192);
        let val = unsafe { std::ptr::read(attacher.address()) };
        assert_eq!(val, 42u8);

        drop(attacher);
        creator.unlink();
    }

    #[test]
    fn test_open_after_unlink_fails_not_found() {
        let name = unique_name("unlink");
        let seg = ShmSegment::create(&name, 256).unwrap();
        seg.unlink();
        let err = ShmSegment::open(&name).unwrap_err();
        assert!(matches!(err, BridgeError::NotFound(_)));
    }

    #[test]
    fn test_unlink_on_closed_handle() {
        let name = unique_name("late_unlink");
        let mut seg = ShmSegment::create(&name, 256).unwrap();
        seg.close();
        // Acts on the stored name even though the mapping is gone
        seg.unlink();
        assert!(matches!(
            ShmSegment::open(&name).unwrap_err(),
            BridgeError::NotFound(_)
        ));
    }

    #[test]
    fn test_exclusive_create_rejects_existing_name() {
        let name = unique_name("excl");
        let first = ShmSegment::create(&name, 64).unwrap();
        let err = ShmSegment::create(&name, 64).unwrap_err();
        assert!(matches!(err, BridgeError::AllocationFailed { .. }));
        first.unlink();
    }

    #[test]
    fn test_create_or_open_dispatch() {
        let name = unique_name("combined");
        let created = ShmSegment::create_or_open(&name, 512, true).unwrap();
        let opened = ShmSegment::create_or_open(&name, 0, false).unwrap();
        assert_eq!(opened.size(), 512);
        drop(opened);
        created.unlink();
    }
}
