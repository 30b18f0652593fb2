//! Driver entry-point resolution.
//!
//! An interceptor shims the driver inside the traced process, which makes
//! symbol lookup treacherous: asking the usual way may hand back the shim
//! itself. The resolver therefore supports a bypass mode that loads the
//! platform's canonical driver libraries directly and refuses any address
//! that lives in the local process image.
//!
//! Lookups never raise errors; a null result *is* the error signal. Every
//! outcome, including a miss, is cached for the life of the process.

use std::collections::HashMap;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;
use std::path::PathBuf;

use libloading::Library;
use log::{debug, trace, warn};
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use vulkanalia::prelude::v1_0::*;

static GLOBAL: Lazy<Resolver> = Lazy::new(|| Resolver::new(DriverSearch::default()));

/// The process-wide resolver over the platform's default driver search.
pub fn global() -> &'static Resolver {
    &GLOBAL
}

type EglGetProcAddress = unsafe extern "C" fn(*const c_char) -> *const c_void;
type GetInstanceProcAddr =
    unsafe extern "system" fn(vk::Instance, *const c_char) -> Option<unsafe extern "system" fn()>;
type GetDeviceProcAddr =
    unsafe extern "system" fn(vk::Device, *const c_char) -> Option<unsafe extern "system" fn()>;

/// A driver API family the resolver can probe for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    OpenGl,
    Vulkan,
}

/// Which libraries to try for each API family, in order. `Default` gives the
/// platform's canonical names; tests inject their own sets.
#[derive(Debug, Clone)]
pub struct DriverSearch {
    /// Directories tried before the system search path. Seeded from
    /// `GFXTAP_DRIVER_DIR` when set.
    pub dirs: Vec<PathBuf>,
    pub egl: Vec<String>,
    pub gles2: Vec<String>,
    pub gles1: Vec<String>,
    pub vulkan: Vec<String>,
}

impl Default for DriverSearch {
    fn default() -> Self {
        let names = |list: &[&str]| list.iter().map(|s| s.to_string()).collect();
        DriverSearch {
            dirs: std::env::var_os("GFXTAP_DRIVER_DIR")
                .map(|dir| vec![PathBuf::from(dir)])
                .unwrap_or_default(),
            egl: names(&["libEGL.so.1", "libEGL.so"]),
            gles2: names(&["libGLESv2.so.2", "libGLESv2.so"]),
            gles1: names(&["libGLESv1_CM.so.1", "libGLESv1_CM.so"]),
            vulkan: if cfg!(windows) {
                names(&["vulkan-1.dll"])
            } else {
                names(&["libvulkan.so.1", "libvulkan.so"])
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Mode {
    LocalFirst,
    BypassLocal,
    VulkanLoader,
}

pub struct Resolver {
    search: DriverSearch,
    cache: Mutex<HashMap<(String, Mode), Option<usize>>>,
    egl: OnceCell<Option<Library>>,
    gles2: OnceCell<Option<Library>>,
    gles1: OnceCell<Option<Library>>,
    vulkan: OnceCell<Option<Library>>,
}

impl Resolver {
    pub fn new(search: DriverSearch) -> Self {
        Resolver {
            search,
            cache: Mutex::new(HashMap::new()),
            egl: OnceCell::new(),
            gles2: OnceCell::new(),
            gles1: OnceCell::new(),
            vulkan: OnceCell::new(),
        }
    }

    /// True when at least one library implementing the capability loads.
    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::OpenGl => {
                self.egl().is_some() || self.gles2().is_some() || self.gles1().is_some()
            }
            Capability::Vulkan => self
                .vulkan()
                .is_some_and(|lib| symbol_address(lib, "vkGetInstanceProcAddr").is_some()),
        }
    }

    /// Address of a GL/GLES driver entry, or null. With `bypass_local` the
    /// local process image — i.e. the interceptor's own shim — is never a
    /// valid answer and the canonical driver libraries are consulted
    /// directly; otherwise local resolution is tried first.
    pub fn resolve(&self, name: &str, bypass_local: bool) -> Option<*const c_void> {
        let mode = if bypass_local { Mode::BypassLocal } else { Mode::LocalFirst };
        self.cached(name, mode, |resolver| {
            if bypass_local {
                resolver.resolve_driver(name)
            } else {
                resolver.resolve_local_first(name)
            }
        })
    }

    /// Instance-level Vulkan entry via the driver's `vkGetInstanceProcAddr`.
    /// `instance` may be null for instance-independent entries; only those
    /// are cached.
    pub fn resolve_vulkan(&self, name: &str, instance: vk::Instance) -> Option<*const c_void> {
        if instance.is_null() {
            return self.cached(name, Mode::VulkanLoader, |resolver| {
                resolver.vulkan_instance_lookup(name, instance)
            });
        }
        self.vulkan_instance_lookup(name, instance)
            .map(|addr| addr as *const c_void)
    }

    /// Device-level Vulkan entry through `vkGetDeviceProcAddr`, itself
    /// resolved recursively at instance level.
    pub fn resolve_vulkan_device(
        &self,
        name: &str,
        instance: vk::Instance,
        device: vk::Device,
    ) -> Option<*const c_void> {
        let gdpa = self.resolve_vulkan("vkGetDeviceProcAddr", instance)?;
        let gdpa: GetDeviceProcAddr = unsafe { std::mem::transmute(gdpa) };
        let symbol = CString::new(name).ok()?;
        unsafe { gdpa(device, symbol.as_ptr()) }.map(|f| f as *const c_void)
    }

    fn cached(
        &self,
        name: &str,
        mode: Mode,
        lookup: impl FnOnce(&Self) -> Option<usize>,
    ) -> Option<*const c_void> {
        let key = (name.to_string(), mode);
        {
            let cache = self.cache.lock();
            if let Some(&outcome) = cache.get(&key) {
                trace!("resolver cache hit: {name} ({mode:?}) -> {outcome:?}");
                return outcome.map(|addr| addr as *const c_void);
            }
        }
        let outcome = lookup(self);
        if outcome.is_none() {
            // Logged once; repeats come out of the cache silently.
            debug!("no driver symbol for {name} ({mode:?})");
        }
        self.cache.lock().entry(key).or_insert(outcome);
        outcome.map(|addr| addr as *const c_void)
    }

    fn resolve_driver(&self, name: &str) -> Option<usize> {
        for lib in [self.egl(), self.gles2(), self.gles1()].into_iter().flatten() {
            if let Some(addr) = symbol_address(lib, name) {
                return Some(addr);
            }
        }
        // Fall back to the driver's own dispatcher. It may still hand back a
        // locally registered shim, which is exactly what bypass must avoid.
        let gpa = symbol_address(self.egl()?, "eglGetProcAddress")?;
        let gpa: EglGetProcAddress = unsafe { std::mem::transmute(gpa) };
        let symbol = CString::new(name).ok()?;
        let addr = unsafe { gpa(symbol.as_ptr()) };
        if addr.is_null() {
            return None;
        }
        if is_local_address(addr) {
            warn!("eglGetProcAddress({name}) points into the local image; ignoring");
            return None;
        }
        Some(addr as usize)
    }

    fn resolve_local_first(&self, name: &str) -> Option<usize> {
        let local = local_image()?;
        if let Some(gpa) = symbol_address(&local, "eglGetProcAddress") {
            let gpa: EglGetProcAddress = unsafe { std::mem::transmute(gpa) };
            let symbol = CString::new(name).ok()?;
            let addr = unsafe { gpa(symbol.as_ptr()) };
            if !addr.is_null() {
                return Some(addr as usize);
            }
        }
        symbol_address(&local, name)
    }

    fn vulkan_instance_lookup(&self, name: &str, instance: vk::Instance) -> Option<usize> {
        let gipa = symbol_address(self.vulkan()?, "vkGetInstanceProcAddr")?;
        let gipa: GetInstanceProcAddr = unsafe { std::mem::transmute(gipa) };
        let symbol = CString::new(name).ok()?;
        unsafe { gipa(instance, symbol.as_ptr()) }.map(|f| f as usize)
    }

    fn egl(&self) -> Option<&Library> {
        self.egl.get_or_init(|| self.open(&self.search.egl)).as_ref()
    }

    fn gles2(&self) -> Option<&Library> {
        self.gles2.get_or_init(|| self.open(&self.search.gles2)).as_ref()
    }

    fn gles1(&self) -> Option<&Library> {
        self.gles1.get_or_init(|| self.open(&self.search.gles1)).as_ref()
    }

    fn vulkan(&self) -> Option<&Library> {
        self.vulkan.get_or_init(|| self.open(&self.search.vulkan)).as_ref()
    }

    fn open(&self, names: &[String]) -> Option<Library> {
        for dir in &self.search.dirs {
            for name in names {
                if let Ok(lib) = unsafe { Library::new(dir.join(name)) } {
                    debug!("loaded {name} from {}", dir.display());
                    return Some(lib);
                }
            }
        }
        for name in names {
            if let Ok(lib) = unsafe { Library::new(name) } {
                debug!("loaded {name} from the system search path");
                return Some(lib);
            }
        }
        debug!("none of {names:?} could be loaded");
        None
    }
}

/// Raw address of an exported symbol, or None.
fn symbol_address(lib: &Library, name: &str) -> Option<usize> {
    let sym = unsafe { lib.get::<unsafe extern "C" fn()>(name.as_bytes()) }.ok()?;
    Some(*sym as usize)
}

/// The current process image, for local-first resolution.
fn local_image() -> Option<Library> {
    #[cfg(unix)]
    {
        Some(libloading::os::unix::Library::this().into())
    }
    #[cfg(windows)]
    {
        libloading::os::windows::Library::this().ok().map(Into::into)
    }
    #[cfg(not(any(unix, windows)))]
    {
        None
    }
}

/// Does `addr` live inside the same loaded object as this crate?
#[cfg(unix)]
fn is_local_address(addr: *const c_void) -> bool {
    unsafe {
        let mut here: libc::Dl_info = std::mem::zeroed();
        let mut there: libc::Dl_info = std::mem::zeroed();
        if libc::dladdr(is_local_address as *const c_void, &mut here) == 0
            || libc::dladdr(addr, &mut there) == 0
        {
            return false;
        }
        if here.dli_fname.is_null() || there.dli_fname.is_null() {
            return false;
        }
        CStr::from_ptr(here.dli_fname) == CStr::from_ptr(there.dli_fname)
    }
}

#[cfg(not(unix))]
fn is_local_address(_addr: *const c_void) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unloadable() -> DriverSearch {
        DriverSearch {
            dirs: Vec::new(),
            egl: vec!["libgfxtap-no-such-egl.so".into()],
            gles2: vec!["libgfxtap-no-such-gles2.so".into()],
            gles1: vec!["libgfxtap-no-such-gles1.so".into()],
            vulkan: vec!["libgfxtap-no-such-vulkan.so".into()],
        }
    }

    #[test]
    fn unloadable_libraries_report_no_capability() {
        let _ = pretty_env_logger::try_init();
        let resolver = Resolver::new(unloadable());
        assert!(!resolver.has(Capability::OpenGl));
        assert!(!resolver.has(Capability::Vulkan));
        assert!(resolver.resolve("glFlush", true).is_none());
    }

    #[test]
    fn misses_are_cached_and_deterministic() {
        let resolver = Resolver::new(unloadable());
        assert!(resolver.resolve("eglCreateContext", true).is_none());
        assert!(resolver.resolve("eglCreateContext", true).is_none());
        assert_eq!(resolver.cache.lock().len(), 1);
    }

    // libm stands in for a driver library: the point is the search and cache
    // machinery, not EGL itself.
    #[cfg(target_os = "linux")]
    #[test]
    fn hits_resolve_through_the_injected_library() {
        let mut search = unloadable();
        search.egl = vec!["libm.so.6".into()];
        let resolver = Resolver::new(search);
        assert!(resolver.has(Capability::OpenGl));

        let first = resolver.resolve("cos", true).expect("libm exports cos");
        let second = resolver.resolve("cos", true).unwrap();
        assert_eq!(first, second);
        // A driver-library address is by definition not ours.
        assert!(!is_local_address(first));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn crate_code_is_recognised_as_local() {
        assert!(is_local_address(is_local_address as *const c_void));
    }
}
