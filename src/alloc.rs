//! Executable-memory primitive shared by the trampoline/thunk generator and
//! the detour engine: page-aligned regions that start out writable, get
//! their code emitted, and are then flipped read+execute.

use crate::error::{Error, Result};
use region::Protection;
use std::ptr::NonNull;

/// An owned, page-backed region of executable memory.
///
/// `W^X` is honored by construction: the region is `RW` while [`ExecutableBuffer::write`]
/// is filling it in, and is flipped to `RX` by [`ExecutableBuffer::make_executable`]
/// before any code inside it is reachable.
pub struct ExecutableBuffer {
    ptr: NonNull<u8>,
    len: usize,
    executable: bool,
}

// SAFETY: the buffer owns a unique allocation; sharing a reference across
// threads is fine since all mutation happens before `make_executable` and
// through `&mut self`.
unsafe impl Send for ExecutableBuffer {}
unsafe impl Sync for ExecutableBuffer {}

impl ExecutableBuffer {
    /// Allocates a region of at least `len` bytes, initially read+write.
    pub fn allocate(len: usize) -> Result<Self> {
        let page = region::page::size();
        let rounded = len.div_ceil(page) * page;

        let map = region::alloc(rounded, Protection::READ_WRITE)
            .map_err(|_| Error::ExecutableAllocationFailed)?;
        let ptr = NonNull::new(map.as_ptr::<u8>() as *mut u8)
            .ok_or(Error::ExecutableAllocationFailed)?;
        // The region crate frees on drop of `region::Allocation`; we want to
        // own the lifetime ourselves so we leak its wrapper and manage the
        // raw pointer directly, freeing it in our own `Drop` impl.
        std::mem::forget(map);

        Ok(ExecutableBuffer {
            ptr,
            len: rounded,
            executable: false,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Copies `code` to the start of the buffer. The buffer must still be
    /// writable (i.e. `make_executable` has not been called yet).
    pub fn write(&mut self, code: &[u8]) -> Result<()> {
        if self.executable {
            return Err(Error::ExecutableAllocationFailed);
        }
        if code.len() > self.len {
            return Err(Error::ExecutableAllocationFailed);
        }
        unsafe { std::ptr::copy_nonoverlapping(code.as_ptr(), self.ptr.as_ptr(), code.len()) };
        Ok(())
    }

    /// Flips the region to read+execute. No further writes are possible.
    pub fn make_executable(&mut self) -> Result<()> {
        unsafe {
            region::protect(self.ptr.as_ptr(), self.len, Protection::READ_EXECUTE)
                .map_err(|_| Error::ExecutableAllocationFailed)?;
        }
        self.executable = true;
        Ok(())
    }

    pub fn address(&self) -> crate::pointer::Address {
        crate::pointer::Address::from(self.ptr.as_ptr())
    }
}

impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        unsafe {
            let _ = region::free_raw(self.ptr.as_ptr(), self.len);
        }
    }
}

/// Toggles a target's own page(s) to `RWX` for the duration of `f`, then
/// restores the previous protection. Used while patching a live prologue.
pub fn with_writable_code<T>(
    address: crate::pointer::Address,
    len: usize,
    f: impl FnOnce() -> T,
) -> Result<T> {
    let query = region::query(address.as_ptr()).map_err(|_| Error::ExecutableAllocationFailed)?;
    let previous = query.protection();

    unsafe {
        region::protect(address.as_ptr(), len, Protection::READ_WRITE_EXECUTE)
            .map_err(|_| Error::ExecutableAllocationFailed)?;
    }

    let result = f();

    unsafe {
        let _ = region::protect(address.as_ptr(), len, previous);
    }

    Ok(result)
}
