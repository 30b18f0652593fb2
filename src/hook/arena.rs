//! Executable code arena.
//!
//! Trampolines live in pages owned by the arena for the rest of the process.
//! Bytes are written while the pages are still writable, then the mapping is
//! flipped to read-execute and the instruction cache is flushed, so published
//! code is never simultaneously writable.

use std::ptr::NonNull;

use log::debug;
use parking_lot::Mutex;

use crate::errors::HookError;

/// Which addresses a published trampoline must land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reach {
    /// Below 4 GiB, so 32-bit literals can name the allocation.
    Low,
    /// Anywhere.
    Any,
}

struct Mapping {
    base: *mut u8,
    len: usize,
}

// Mappings are only ever touched under the arena lock.
unsafe impl Send for Mapping {}

/// A pool of read-execute pages. One process-wide arena backs the default
/// [`Hooker`](super::Hooker); tests inject fresh arenas so published code
/// stays local to them.
pub struct CodeArena {
    mappings: Mutex<Vec<Mapping>>,
}

impl CodeArena {
    pub fn new() -> Self {
        CodeArena { mappings: Mutex::new(Vec::new()) }
    }

    /// Copy `code` into fresh pages and publish them read-execute. The
    /// returned address is page-aligned and valid until the arena is dropped.
    pub(crate) fn publish(&self, code: &[u8], reach: Reach) -> Result<NonNull<u8>, HookError> {
        let len = round_to_pages(code.len());
        let base = match reach {
            // Prefer the low arena, but a high mapping still works: every
            // trampoline reaches it through a 64-bit literal.
            Reach::Low => map_low(len).or_else(|| map_any(len)),
            Reach::Any => map_any(len),
        }
        .ok_or(HookError::ArenaExhausted(code.len()))?;

        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), base, code.len());
            protect_execute(base, len).map_err(HookError::Protection)?;
        }
        flush_instruction_cache(base as *const u8, code.len());
        debug!("published {} trampoline bytes at {:p}", code.len(), base);

        self.mappings.lock().push(Mapping { base, len });
        Ok(NonNull::new(base).unwrap())
    }

    /// Release a previously published allocation. Only safe while nothing can
    /// still execute it, i.e. before the hook patch is in place.
    pub(crate) fn discard(&self, ptr: NonNull<u8>) {
        let mut mappings = self.mappings.lock();
        if let Some(at) = mappings.iter().position(|m| m.base == ptr.as_ptr()) {
            let mapping = mappings.swap_remove(at);
            unsafe { unmap(mapping.base, mapping.len) };
        }
    }
}

impl Default for CodeArena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CodeArena {
    fn drop(&mut self) {
        // The process-wide arena is never dropped; this only runs for
        // injected test arenas, after their trampolines are dead.
        for mapping in self.mappings.get_mut().drain(..) {
            unsafe { unmap(mapping.base, mapping.len) };
        }
    }
}

pub(crate) fn round_to_pages(len: usize) -> usize {
    let page = page_size();
    (len.max(1) + page - 1) & !(page - 1)
}

#[cfg(unix)]
pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(not(unix))]
pub(crate) fn page_size() -> usize {
    4096
}

#[cfg(unix)]
fn map_any(len: usize) -> Option<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    (ptr != libc::MAP_FAILED).then_some(ptr as *mut u8)
}

/// Hint-probe for a mapping below 4 GiB. `MAP_32BIT` is x86-only, so this
/// works on every architecture at the cost of a few attempts.
#[cfg(unix)]
fn map_low(len: usize) -> Option<*mut u8> {
    for hint in [0x6000_0000u64, 0x4000_0000, 0x2000_0000, 0x1000_0000] {
        let ptr = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            continue;
        }
        if (ptr as u64) + (len as u64) <= 1 << 32 {
            return Some(ptr as *mut u8);
        }
        unsafe { libc::munmap(ptr, len) };
    }
    None
}

#[cfg(unix)]
unsafe fn protect_execute(base: *mut u8, len: usize) -> std::io::Result<()> {
    if libc::mprotect(base as *mut libc::c_void, len, libc::PROT_READ | libc::PROT_EXEC) != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
unsafe fn unmap(base: *mut u8, len: usize) {
    libc::munmap(base as *mut libc::c_void, len);
}

#[cfg(not(unix))]
fn map_any(_len: usize) -> Option<*mut u8> {
    None
}

#[cfg(not(unix))]
fn map_low(_len: usize) -> Option<*mut u8> {
    None
}

#[cfg(not(unix))]
unsafe fn protect_execute(_base: *mut u8, _len: usize) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
unsafe fn unmap(_base: *mut u8, _len: usize) {}

#[cfg(target_arch = "aarch64")]
extern "C" {
    fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
}

/// Make freshly written instructions visible to the instruction fetch on
/// architectures with incoherent instruction caches.
pub(crate) fn flush_instruction_cache(ptr: *const u8, len: usize) {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        __clear_cache(ptr as *mut libc::c_char, ptr.add(len) as *mut libc::c_char);
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = (ptr, len);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn publish_returns_page_aligned_readable_copy() {
        let arena = CodeArena::new();
        let code = [0xAAu8, 0xBB, 0xCC, 0xDD];
        let ptr = arena.publish(&code, Reach::Any).unwrap();
        assert_eq!(ptr.as_ptr() as usize % page_size(), 0);
        let copied = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), code.len()) };
        assert_eq!(copied, &code);
    }

    #[test]
    fn low_reach_lands_under_4g_when_available() {
        let arena = CodeArena::new();
        let ptr = arena.publish(&[0u8; 16], Reach::Low).unwrap();
        // The fallback to a high mapping is legal, so only assert when the
        // probe found low memory.
        if (ptr.as_ptr() as u64) < 1 << 32 {
            assert!(ptr.as_ptr() as u64 + 16 <= 1 << 32);
        }
    }

    #[test]
    fn discard_releases_the_mapping() {
        let arena = CodeArena::new();
        let ptr = arena.publish(&[0x90u8; 64], Reach::Any).unwrap();
        arena.discard(ptr);
        assert!(arena.mappings.lock().is_empty());
    }
}
