//! Module loader & registry.
//!
//! Opens a shared module by path, measures its loaded image, caches by
//! absolute path, and resolves exported symbols.

use crate::error::{Error, Result};
use crate::pointer::Address;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[cfg(unix)]
const PLATFORM_EXTENSION: &str = "so";
#[cfg(windows)]
const PLATFORM_EXTENSION: &str = "dll";

/// Options accepted by [`open_with`]; mirrors the function record's
/// `srv_check` key, default `true`.
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    pub srv_check: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions { srv_check: true }
    }
}

/// `{ path, base_address, image_size, handle }`.
pub struct Module {
    path: PathBuf,
    base_address: Address,
    image_size: usize,
    #[allow(dead_code)]
    handle: RawHandle,
    /// Present only for synthetic modules built for unit tests, which don't
    /// go through the OS loader at all.
    owned_image: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy)]
struct RawHandle(usize);

// SAFETY: the handle is an opaque OS loader token; its validity outlives the
// registry entry that holds it, and the OS permits it to be used from any
// thread.
unsafe impl Send for RawHandle {}
unsafe impl Sync for RawHandle {}

static REGISTRY: Lazy<RwLock<HashMap<PathBuf, Arc<Module>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

impl Module {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn base_address(&self) -> Address {
        self.base_address
    }

    pub const fn image_size(&self) -> usize {
        self.image_size
    }

    /// The contiguous mapped bytes used to bound signature scans.
    pub fn image(&self) -> &[u8] {
        if let Some(owned) = &self.owned_image {
            return owned;
        }
        unsafe { std::slice::from_raw_parts(self.base_address.as_ptr(), self.image_size) }
    }

    /// Resolves an exported symbol. Returns `None`, not an error, so callers
    /// can fall back to signature scanning.
    pub fn find_symbol(&self, name: &str) -> Option<Address> {
        trace!(symbol = name, module = %self.path.display(), "resolving symbol");
        platform::find_symbol(self, name)
    }

    /// Builds a module view directly over an in-process byte buffer, for
    /// tests that need to drive the signature scanner without a real OS
    /// module. Not part of the public module-loader surface.
    #[doc(hidden)]
    pub fn from_raw_image_for_test(image: Vec<u8>) -> Module {
        let base_address = Address::from(image.as_ptr());
        let image_size = image.len();
        Module {
            path: PathBuf::from("<test-image>"),
            base_address,
            image_size,
            handle: RawHandle(0),
            owned_image: Some(image),
        }
    }
}

/// Opens `path` with default [`OpenOptions`] (`srv_check = true`).
pub fn open(path: impl AsRef<Path>) -> Result<Arc<Module>> {
    open_with(path, OpenOptions::default())
}

/// Opens `path`, trying it as-given and then with the platform extension
/// appended if missing. Repeated opens of the same absolute path return the
/// cached record.
pub fn open_with(path: impl AsRef<Path>, options: OpenOptions) -> Result<Arc<Module>> {
    let requested = path.as_ref();
    let candidates = candidate_paths(requested);

    for candidate in &candidates {
        if let Some(absolute) = resolve_existing(candidate, options) {
            if let Some(cached) = REGISTRY.read().get(&absolute).cloned() {
                debug!(path = %absolute.display(), "module already open, returning cached record");
                return Ok(cached);
            }

            debug!(path = %absolute.display(), srv_check = options.srv_check, "opening module");
            let module = Arc::new(platform::load(&absolute, options)?);
            REGISTRY.write().insert(absolute, module.clone());
            return Ok(module);
        }
    }

    warn!(path = %requested.display(), "module not found on any candidate extension");
    Err(Error::ModuleNotFound(requested.to_path_buf()))
}

fn candidate_paths(requested: &Path) -> Vec<PathBuf> {
    let has_extension = requested.extension().is_some();
    if has_extension {
        vec![requested.to_path_buf()]
    } else {
        let mut with_ext = requested.to_path_buf();
        with_ext.set_extension(PLATFORM_EXTENSION);
        vec![requested.to_path_buf(), with_ext]
    }
}

/// Resolves a candidate path to an existing absolute path, honoring
/// `srv_check`: an already-absolute path is just checked for existence (the
/// caller named an exact location, so there's no "search" to restrict), but
/// a bare relative identifier (e.g. `binary = "server"`) is looked up either
/// under the controlling process' own directory (`srv_check = true`) or
/// under the current directory (`srv_check = false`, the unrestricted OS
/// loader's usual starting point) — never both, so the two settings produce
/// genuinely different candidate sets.
fn resolve_existing(path: &Path, options: OpenOptions) -> Option<PathBuf> {
    if path.is_absolute() {
        return path.exists().then(|| path.to_path_buf());
    }

    let root = if options.srv_check {
        std::env::current_exe().ok()?.parent()?.to_path_buf()
    } else {
        std::env::current_dir().ok()?
    };
    let absolute = root.join(path);
    absolute.exists().then_some(absolute)
}

/// Converts an `&str` into the NUL-terminated form both platform loaders need.
fn to_cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|e| Error::Os(e.to_string()))
}

#[cfg(unix)]
mod platform {
    use super::*;
    use std::io::{BufRead, BufReader};

    /// `absolute` has already been resolved by [`resolve_existing`], which
    /// is where `srv_check`'s candidate-directory restriction actually
    /// happens; by this point there is a single concrete path to `dlopen`.
    pub fn load(absolute: &Path, _options: OpenOptions) -> Result<Module> {
        let cpath = to_cstring(&absolute.to_string_lossy())?;
        let handle = unsafe { libc::dlopen(cpath.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            let message = unsafe {
                let err = libc::dlerror();
                if err.is_null() {
                    "dlopen failed".to_string()
                } else {
                    std::ffi::CStr::from_ptr(err).to_string_lossy().into_owned()
                }
            };
            return Err(Error::Os(message));
        }

        let (base_address, image_size) = image_bounds(absolute)?;

        Ok(Module {
            path: absolute.to_path_buf(),
            base_address,
            image_size,
            handle: RawHandle(handle as usize),
            owned_image: None,
        })
    }

    pub fn find_symbol(module: &Module, name: &str) -> Option<Address> {
        let cname = to_cstring(name).ok()?;
        let handle = module.handle.0 as *mut libc::c_void;
        let sym = unsafe { libc::dlsym(handle, cname.as_ptr()) };
        if sym.is_null() {
            None
        } else {
            Some(Address::from(sym))
        }
    }

    /// Parses `/proc/self/maps` to find the contiguous range of mappings for
    /// `path`, used to bound the image for signature scanning.
    fn image_bounds(path: &Path) -> Result<(Address, usize)> {
        let file = std::fs::File::open("/proc/self/maps")
            .map_err(|e| Error::Os(format!("failed to read /proc/self/maps: {e}")))?;
        let path_str = path.to_string_lossy();

        let mut lo: Option<usize> = None;
        let mut hi: usize = 0;

        for line in BufReader::new(file).lines().map_while(|l| l.ok()) {
            if !line.ends_with(path_str.as_ref()) {
                continue;
            }
            let Some(range) = line.split_whitespace().next() else {
                continue;
            };
            let Some((start, end)) = range.split_once('-') else {
                continue;
            };
            let (Ok(start), Ok(end)) = (
                usize::from_str_radix(start, 16),
                usize::from_str_radix(end, 16),
            ) else {
                continue;
            };
            lo = Some(lo.map_or(start, |cur| cur.min(start)));
            hi = hi.max(end);
        }

        match lo {
            Some(base) => Ok((Address::new(base), hi - base)),
            None => Err(Error::Os(format!(
                "module {} is not mapped in /proc/self/maps",
                path.display()
            ))),
        }
    }
}

#[cfg(windows)]
mod platform {
    use super::*;
    use std::os::windows::ffi::OsStrExt;
    use windows_sys::Win32::Foundation::HMODULE;
    use windows_sys::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};
    use windows_sys::Win32::System::ProcessStatus::{GetModuleInformation, MODULEINFO};
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    pub fn load(absolute: &Path, _options: OpenOptions) -> Result<Module> {
        let wide: Vec<u16> = absolute
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        let handle: HMODULE = unsafe { LoadLibraryW(wide.as_ptr()) };
        if handle == 0 {
            return Err(Error::Os(format!(
                "LoadLibraryW({}) failed",
                absolute.display()
            )));
        }

        let mut info: MODULEINFO = unsafe { std::mem::zeroed() };
        let ok = unsafe {
            GetModuleInformation(
                GetCurrentProcess(),
                handle,
                &mut info,
                std::mem::size_of::<MODULEINFO>() as u32,
            )
        };
        if ok == 0 {
            return Err(Error::Os("GetModuleInformation failed".to_string()));
        }

        Ok(Module {
            path: absolute.to_path_buf(),
            base_address: Address::new(info.lpBaseOfDll as usize),
            image_size: info.SizeOfImage as usize,
            handle: RawHandle(handle as usize),
            owned_image: None,
        })
    }

    pub fn find_symbol(module: &Module, name: &str) -> Option<Address> {
        let cname = to_cstring(name).ok()?;
        let handle = module.handle.0 as HMODULE;
        let proc = unsafe { GetProcAddress(handle, cname.as_ptr() as *const u8) };
        proc.map(|f| Address::new(f as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_paths_appends_extension_when_missing() {
        let candidates = candidate_paths(Path::new("server"));
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0], Path::new("server"));
        assert_eq!(candidates[1].extension().unwrap(), PLATFORM_EXTENSION);
    }

    #[test]
    fn candidate_paths_keeps_explicit_extension() {
        let candidates = candidate_paths(Path::new("server.so"));
        assert_eq!(candidates, vec![PathBuf::from("server.so")]);
    }
}
