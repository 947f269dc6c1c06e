//! Dynamic library loading for patch modules
//!
//! Patch modules are opened with `dlopen(RTLD_NOW | RTLD_GLOBAL)` and never
//! closed: once a slot or call site points into a module, unmapping it would
//! leave dangling code pointers behind, so modules accumulate until the
//! process exits.

use std::ffi::{CStr, CString};
use std::path::Path;

use livepatch_sdk::{LpManifest, ManifestFn, LIVEPATCH_ABI_VERSION, MANIFEST_SYMBOL};

use crate::error::LoadError;

/// A loaded shared object
pub struct Library {
    handle: *mut libc::c_void,
    path: String,
}

// SAFETY: the handle is only passed back to dlsym, which is thread-safe.
unsafe impl Send for Library {}
unsafe impl Sync for Library {}

impl Library {
    /// Load a shared object from the given path.
    ///
    /// `RTLD_NOW` resolves every symbol immediately so a broken module fails
    /// here instead of at its first call; `RTLD_GLOBAL` makes its exports
    /// visible to modules loaded afterwards.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let path_ref = path.as_ref();
        let path_str = path_ref
            .to_str()
            .ok_or_else(|| LoadError::InvalidPath(format!("{:?}", path_ref)))?;

        let c_path = CString::new(path_str)
            .map_err(|e| LoadError::PlatformError(format!("Invalid path: {}", e)))?;

        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };

        if handle.is_null() {
            return Err(LoadError::NotFound {
                path: format!("{}: {}", path_str, last_error()),
            });
        }

        Ok(Library {
            handle,
            path: path_str.to_string(),
        })
    }

    /// Get a symbol address by name.
    pub fn symbol(&self, name: &str) -> Result<*mut libc::c_void, LoadError> {
        let c_name = CString::new(name)
            .map_err(|e| LoadError::PlatformError(format!("Invalid symbol name: {}", e)))?;

        unsafe {
            // Clear any previous errors
            libc::dlerror();

            let symbol = libc::dlsym(self.handle, c_name.as_ptr());

            let err_ptr = libc::dlerror();
            if !err_ptr.is_null() {
                let error = CStr::from_ptr(err_ptr).to_string_lossy().into_owned();
                return Err(LoadError::SymbolNotFound {
                    symbol: name.to_string(),
                    library: format!("{}: {}", self.path, error),
                });
            }

            if symbol.is_null() {
                return Err(LoadError::SymbolNotFound {
                    symbol: name.to_string(),
                    library: self.path.clone(),
                });
            }

            Ok(symbol)
        }
    }

    /// Call the module's manifest entry point and check its ABI version.
    pub fn manifest(&self) -> Result<&'static LpManifest, LoadError> {
        let entry = self.symbol(MANIFEST_SYMBOL)?;

        unsafe {
            let entry: ManifestFn = std::mem::transmute::<*mut libc::c_void, ManifestFn>(entry);
            let manifest = entry();
            if manifest.is_null() {
                return Err(LoadError::InvalidManifest {
                    library: self.path.clone(),
                    reason: format!("{} returned null", MANIFEST_SYMBOL),
                });
            }

            let manifest = &*manifest;
            if manifest.abi_version != LIVEPATCH_ABI_VERSION {
                return Err(LoadError::InvalidManifest {
                    library: self.path.clone(),
                    reason: format!(
                        "ABI version {} (expected {})",
                        manifest.abi_version, LIVEPATCH_ABI_VERSION
                    ),
                });
            }
            Ok(manifest)
        }
    }

    /// Get the path this library was loaded from
    pub fn path(&self) -> &str {
        &self.path
    }
}

fn last_error() -> String {
    unsafe {
        let err_ptr = libc::dlerror();
        if err_ptr.is_null() {
            "Unknown error".to_string()
        } else {
            CStr::from_ptr(err_ptr).to_string_lossy().into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_not_found() {
        let result = Library::open("/nonexistent/library.so");
        match result {
            Err(LoadError::NotFound { path }) => assert!(path.starts_with("/nonexistent")),
            _ => panic!("Expected NotFound error"),
        }
    }

    #[test]
    fn test_interior_nul_in_path() {
        let result = Library::open("bad\0path.so");
        assert!(matches!(result, Err(LoadError::PlatformError(_))));
    }
}
