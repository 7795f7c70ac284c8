use crate::Address;
use core::borrow::{Borrow, BorrowMut};
use core::ffi::c_void;
use core::mem::size_of;
use core::num::NonZeroUsize;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use core::slice::{from_raw_parts, from_raw_parts_mut};
use nix::sys::mman;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

const PAGE_SIZE: usize = 1 << 12;

/* from linux kernel headers.
#define HUGETLB_FLAG_ENCODE_SHIFT       26
#define HUGETLB_FLAG_ENCODE_MASK        0x3f

#define HUGETLB_FLAG_ENCODE_64KB        (16 << HUGETLB_FLAG_ENCODE_SHIFT)
#define HUGETLB_FLAG_ENCODE_512KB       (19 << HUGETLB_FLAG_ENCODE_SHIFT)
#define HUGETLB_FLAG_ENCODE_1MB         (20 << HUGETLB_FLAG_ENCODE_SHIFT)
#define HUGETLB_FLAG_ENCODE_2MB         (21 << HUGETLB_FLAG_ENCODE_SHIFT)
*/

#[derive(Debug, Error)]
pub enum MapError {
    #[error("cannot map an empty region")]
    Empty,
    #[error("mmap failed: {0}")]
    Mmap(#[from] nix::Error),
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("offset {offset:#x} is outside of the {len} byte mapping")]
    OffsetOutOfRange { offset: usize, len: usize },
}

/// Private anonymous mapping holding `size` values of `T`, page aligned.
pub struct MMappedMemory<T> {
    pointer: NonNull<T>,
    size: usize,
}

unsafe impl<T: Send> Send for MMappedMemory<T> {}
unsafe impl<T: Sync> Sync for MMappedMemory<T> {}

impl<T> MMappedMemory<T> {
    pub fn try_new(size: usize, huge: bool) -> Result<MMappedMemory<T>, MapError> {
        assert_ne!(size_of::<T>(), 0);
        let bytes = size
            .checked_mul(size_of::<T>())
            .and_then(NonZeroUsize::new)
            .ok_or(MapError::Empty)?;
        let p = unsafe {
            mman::mmap_anonymous(
                None,
                bytes,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                mman::MapFlags::MAP_PRIVATE | huge_flag(huge),
            )?
        };
        Ok(MMappedMemory {
            pointer: p.cast(),
            size,
        })
    }

    pub fn try_new_initialized(
        size: usize,
        huge: bool,
        initializer: impl Fn(usize) -> T,
    ) -> Result<MMappedMemory<T>, MapError> {
        let mut m = Self::try_new(size, huge)?;
        for (i, slot) in m.slice_mut().iter_mut().enumerate() {
            // Fresh anonymous memory holds no T to drop.
            unsafe { core::ptr::write(slot, initializer(i)) };
        }
        Ok(m)
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_ptr(&self) -> *const T {
        self.pointer.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.pointer.as_ptr()
    }

    pub fn address(&self, index: usize) -> Option<Address> {
        if index < self.size {
            Some(Address::from_ptr(unsafe { self.as_ptr().add(index) }))
        } else {
            None
        }
    }

    pub fn slice(&self) -> &[T] {
        unsafe { from_raw_parts(self.pointer.as_ptr(), self.size) }
    }

    pub fn slice_mut(&mut self) -> &mut [T] {
        unsafe { from_raw_parts_mut(self.pointer.as_ptr(), self.size) }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn huge_flag(huge: bool) -> mman::MapFlags {
    if huge {
        mman::MapFlags::MAP_HUGETLB
    } else {
        mman::MapFlags::empty()
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn huge_flag(_huge: bool) -> mman::MapFlags {
    mman::MapFlags::empty()
}

impl<T> Drop for MMappedMemory<T> {
    fn drop(&mut self) {
        let bytes = self.size * size_of::<T>();
        if let Err(e) = unsafe { mman::munmap(self.pointer.cast::<c_void>(), bytes) } {
            tracing::warn!("munmap of {} bytes failed: {}", bytes, e);
        }
    }
}

impl<T> Deref for MMappedMemory<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        self.slice()
    }
}

impl<T> DerefMut for MMappedMemory<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.slice_mut()
    }
}

impl<T> AsRef<[T]> for MMappedMemory<T> {
    fn as_ref(&self) -> &[T] {
        self.slice()
    }
}

impl<T> AsMut<[T]> for MMappedMemory<T> {
    fn as_mut(&mut self) -> &mut [T] {
        self.slice_mut()
    }
}

impl<T> Borrow<[T]> for MMappedMemory<T> {
    fn borrow(&self) -> &[T] {
        self.slice()
    }
}

impl<T> BorrowMut<[T]> for MMappedMemory<T> {
    fn borrow_mut(&mut self) -> &mut [T] {
        self.slice_mut()
    }
}

/**
Read-only shared mapping of a whole file, typically a shared library that a
victim process also maps, so that both see the same physical lines.
*/
pub struct MappedFile {
    pointer: NonNull<u8>,
    map_size: usize,
    file_size: usize,
}

unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MapError> {
        let path = path.as_ref();
        let open_error = |source| MapError::Open {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(open_error)?;
        let file_size = file.metadata().map_err(open_error)?.len() as usize;
        // Round up to whole pages.
        let map_size = (file_size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let length = NonZeroUsize::new(map_size).ok_or(MapError::Empty)?;
        let p = unsafe {
            mman::mmap(
                None,
                length,
                mman::ProtFlags::PROT_READ,
                mman::MapFlags::MAP_SHARED,
                &file,
                0,
            )?
        };
        Ok(MappedFile {
            pointer: p.cast(),
            map_size,
            file_size,
        })
    }

    pub fn len(&self) -> usize {
        self.file_size
    }

    pub fn is_empty(&self) -> bool {
        self.file_size == 0
    }

    pub fn address_at(&self, offset: usize) -> Result<Address, MapError> {
        if offset >= self.file_size {
            return Err(MapError::OffsetOutOfRange {
                offset,
                len: self.file_size,
            });
        }
        Ok(Address::from_ptr(unsafe {
            self.pointer.as_ptr().add(offset)
        }))
    }

    pub fn slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.pointer.as_ptr(), self.file_size) }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if let Err(e) = unsafe { mman::munmap(self.pointer.cast::<c_void>(), self.map_size) } {
            tracing::warn!("munmap of {} bytes failed: {}", self.map_size, e);
        }
    }
}
