//! A typed view over a raw address.
//!
//! A [`Pointer`] carries operations, not ownership, unless it was produced by
//! [`Pointer::alloc`] — that one must be explicitly [`Pointer::dealloc`]'d.

use crate::error::{Error, Result};
use std::alloc::Layout;
use std::ffi::{CStr, CString};
use std::fmt;

/// A pointer-width integer; `0` means invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(usize);

impl Address {
    pub const NULL: Address = Address(0);

    pub const fn new(value: usize) -> Self {
        Address(value)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn as_ptr(self) -> *const u8 {
        self.0 as *const u8
    }

    pub fn as_mut_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }
}

impl From<usize> for Address {
    fn from(value: usize) -> Self {
        Address(value)
    }
}

impl<T> From<*const T> for Address {
    fn from(value: *const T) -> Self {
        Address(value as usize)
    }
}

impl<T> From<*mut T> for Address {
    fn from(value: *mut T) -> Self {
        Address(value as usize)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl std::ops::Add<usize> for Address {
    type Output = Address;
    fn add(self, rhs: usize) -> Address {
        Address(self.0.wrapping_add(rhs))
    }
}

impl std::ops::Sub<usize> for Address {
    type Output = Address;
    fn sub(self, rhs: usize) -> Address {
        Address(self.0.wrapping_sub(rhs))
    }
}

impl std::ops::Sub<Address> for Address {
    type Output = isize;
    fn sub(self, rhs: Address) -> isize {
        self.0.wrapping_sub(rhs.0) as isize
    }
}

/// Ownership tag: a [`Pointer`] is "owning" only when it was created through
/// [`Pointer::alloc`]; wrapping an existing [`Address`] always produces a
/// non-owning pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ownership {
    Borrowed,
    Owned { layout: Layout },
    Released,
}

/// A typed view over a raw [`Address`], with typed load/store primitives for
/// every supported value kind plus string, array, copy, and alloc helpers.
#[derive(Debug)]
pub struct Pointer {
    address: Address,
    ownership: Ownership,
}

impl Clone for Pointer {
    fn clone(&self) -> Self {
        // Cloning never duplicates ownership: the clone is always a
        // non-owning view over the same address.
        Pointer {
            address: self.address,
            ownership: Ownership::Borrowed,
        }
    }
}

macro_rules! primitive_accessors {
    ($(($get:ident, $set:ident, $ty:ty)),* $(,)?) => {
        $(
            #[doc = concat!("Reads a `", stringify!($ty), "` at `self + offset`.")]
            pub fn $get(&self, offset: isize) -> Result<$ty> {
                self.check_non_null()?;
                let ptr = self.byte_offset(offset);
                Ok(unsafe { (ptr as *const $ty).read_unaligned() })
            }

            #[doc = concat!("Writes a `", stringify!($ty), "` at `self + offset`.")]
            pub fn $set(&self, value: $ty, offset: isize) -> Result<()> {
                self.check_non_null()?;
                let ptr = self.byte_offset(offset);
                unsafe { (ptr as *mut $ty).write_unaligned(value) };
                Ok(())
            }
        )*
    };
}

impl Pointer {
    /// Wraps an existing address as a non-owning pointer.
    pub fn new(address: Address) -> Self {
        Pointer {
            address,
            ownership: Ownership::Borrowed,
        }
    }

    pub const fn address(&self) -> Address {
        self.address
    }

    pub const fn is_owning(&self) -> bool {
        matches!(self.ownership, Ownership::Owned { .. })
    }

    fn check_non_null(&self) -> Result<()> {
        if self.address.is_null() {
            Err(Error::NullDereference)
        } else {
            Ok(())
        }
    }

    fn byte_offset(&self, offset: isize) -> *mut u8 {
        unsafe { self.address.as_mut_ptr().offset(offset) }
    }

    /// Reads a `bool` at `self + offset`. Goes through `u8` rather than
    /// reading a native `bool` directly: the byte at an arbitrary foreign
    /// address is not guaranteed to be `0x00`/`0x01`, and a Rust `bool` must
    /// be exactly one of those two values, so any other byte read as `bool`
    /// would be immediate undefined behavior.
    pub fn get_bool(&self, offset: isize) -> Result<bool> {
        self.check_non_null()?;
        let ptr = self.byte_offset(offset);
        let byte = unsafe { (ptr as *const u8).read_unaligned() };
        Ok(byte != 0)
    }

    /// Writes a `bool` at `self + offset`, as a single `0x00`/`0x01` byte.
    pub fn set_bool(&self, value: bool, offset: isize) -> Result<()> {
        self.check_non_null()?;
        let ptr = self.byte_offset(offset);
        unsafe { (ptr as *mut u8).write_unaligned(value as u8) };
        Ok(())
    }

    primitive_accessors! {
        (get_i8, set_i8, i8),
        (get_u8, set_u8, u8),
        (get_i16, set_i16, i16),
        (get_u16, set_u16, u16),
        (get_i32, set_i32, i32),
        (get_u32, set_u32, u32),
        (get_i64, set_i64, i64),
        (get_u64, set_u64, u64),
        (get_f32, set_f32, f32),
        (get_f64, set_f64, f64),
    }

    /// Reads a machine word and wraps it as an [`Address`].
    pub fn get_ptr(&self, offset: isize) -> Result<Address> {
        self.check_non_null()?;
        let ptr = self.byte_offset(offset);
        let raw = unsafe { (ptr as *const usize).read_unaligned() };
        Ok(Address::new(raw))
    }

    /// Writes a machine word.
    pub fn set_ptr(&self, value: Address, offset: isize) -> Result<()> {
        self.check_non_null()?;
        let ptr = self.byte_offset(offset);
        unsafe { (ptr as *mut usize).write_unaligned(value.as_usize()) };
        Ok(())
    }

    /// Reads a NUL-terminated C string through one level of indirection:
    /// `*(self + offset)` is itself a pointer to the string's first byte.
    pub fn get_string(&self, offset: isize) -> Result<String> {
        let inner = self.get_ptr(offset)?;
        if inner.is_null() {
            return Err(Error::NullDereference);
        }
        let cstr = unsafe { CStr::from_ptr(inner.as_ptr() as *const std::os::raw::c_char) };
        Ok(cstr.to_string_lossy().into_owned())
    }

    /// Reads a NUL-terminated string stored inline at `self + offset`.
    pub fn get_string_array(&self, offset: isize) -> Result<String> {
        self.check_non_null()?;
        let start = self.byte_offset(offset);
        let cstr = unsafe { CStr::from_ptr(start as *const std::os::raw::c_char) };
        Ok(cstr.to_string_lossy().into_owned())
    }

    /// Writes `text` plus a NUL terminator into an inline buffer of the given
    /// `capacity`; fails with [`Error::CapacityExceeded`] if it would not fit.
    pub fn set_string_array(&self, text: &str, offset: isize, capacity: usize) -> Result<()> {
        self.check_non_null()?;
        let needed = text.len() + 1;
        if needed > capacity {
            return Err(Error::CapacityExceeded { needed, capacity });
        }
        let cstring = CString::new(text).map_err(|_| Error::CapacityExceeded {
            needed,
            capacity,
        })?;
        let bytes = cstring.as_bytes_with_nul();
        let start = self.byte_offset(offset);
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), start, bytes.len()) };
        Ok(())
    }

    /// A lazy view over `length` contiguous values of `T`, starting here.
    pub fn make_array<T: Copy>(&self, length: usize) -> Result<PointerArray<T>> {
        self.check_non_null()?;
        Ok(PointerArray {
            base: self.address,
            length,
            _marker: std::marker::PhantomData,
        })
    }

    /// A lazy view over `length` heterogeneous elements of `element_size`
    /// bytes, each projected through `converter`.
    pub fn make_ptr_array<T>(
        &self,
        element_size: usize,
        length: usize,
        converter: impl Fn(Pointer) -> T + 'static,
    ) -> Result<PointerIndirectArray<T>> {
        self.check_non_null()?;
        Ok(PointerIndirectArray {
            base: self.address,
            element_size,
            length,
            converter: Box::new(converter),
        })
    }

    /// Bit-exact byte copy from `self` into `dst`.
    pub fn copy(&self, dst: &Pointer, size: usize) -> Result<()> {
        self.check_non_null()?;
        dst.check_non_null()?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.address.as_ptr(), dst.address.as_mut_ptr(), size)
        };
        Ok(())
    }

    /// Allocates `size` bytes on the heap and returns an owning [`Pointer`].
    pub fn alloc(size: usize) -> Result<Pointer> {
        let layout = Layout::array::<u8>(size).map_err(|_| Error::ExecutableAllocationFailed)?;
        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(Error::ExecutableAllocationFailed);
        }
        Ok(Pointer {
            address: Address::from(ptr),
            ownership: Ownership::Owned { layout },
        })
    }

    /// Releases memory obtained through [`Pointer::alloc`]. A pointer that is
    /// not owning, or has already been released, fails with
    /// [`Error::InvalidOwnership`].
    pub fn dealloc(&mut self) -> Result<()> {
        match self.ownership {
            Ownership::Owned { layout } => {
                unsafe { std::alloc::dealloc(self.address.as_mut_ptr(), layout) };
                self.ownership = Ownership::Released;
                Ok(())
            }
            Ownership::Borrowed | Ownership::Released => Err(Error::InvalidOwnership),
        }
    }
}

impl PartialEq for Pointer {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}
impl Eq for Pointer {}

impl PartialOrd for Pointer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Pointer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.address.cmp(&other.address)
    }
}

impl std::ops::Add<usize> for Pointer {
    type Output = Pointer;
    fn add(self, rhs: usize) -> Pointer {
        Pointer {
            address: self.address + rhs,
            ownership: Ownership::Borrowed,
        }
    }
}

impl std::ops::Sub<usize> for Pointer {
    type Output = Pointer;
    fn sub(self, rhs: usize) -> Pointer {
        Pointer {
            address: self.address - rhs,
            ownership: Ownership::Borrowed,
        }
    }
}

/// Lazy sequence view produced by [`Pointer::make_array`].
pub struct PointerArray<T> {
    base: Address,
    length: usize,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Copy> PointerArray<T> {
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn get(&self, index: usize) -> Result<T> {
        if index >= self.length {
            return Err(Error::ArgumentOutOfRange {
                position: index,
                tag: 'p',
            });
        }
        let ptr = (self.base.as_usize() + index * std::mem::size_of::<T>()) as *const T;
        Ok(unsafe { ptr.read_unaligned() })
    }
}

/// Lazy sequence view produced by [`Pointer::make_ptr_array`], for
/// heterogeneous element spans projected through a converter.
pub struct PointerIndirectArray<T> {
    base: Address,
    element_size: usize,
    length: usize,
    converter: Box<dyn Fn(Pointer) -> T>,
}

impl<T> PointerIndirectArray<T> {
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn get(&self, index: usize) -> Result<T> {
        if index >= self.length {
            return Err(Error::ArgumentOutOfRange {
                position: index,
                tag: 'p',
            });
        }
        let element = Pointer::new(self.base + index * self.element_size);
        Ok((self.converter)(element))
    }
}

// SAFETY: a Pointer is a thin wrapper over an address plus an allocation
// layout tag; it has no thread-affinity of its own. Callers are responsible
// for not racing reads/writes to the same address, same as raw pointers.
unsafe impl Send for Pointer {}
unsafe impl Sync for Pointer {}
