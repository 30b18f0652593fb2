//! Instruction-level function hooking.
//!
//! [`Hooker::install`] redirects a function to an interceptor by patching a
//! short jump over its prologue. The displaced instructions are relocated
//! into an executable arena and followed by a jump back into the original
//! body, so the interceptor can still reach the unhooked behaviour through
//! [`Hook::trampoline`]. Hooks are never uninstalled; the patched bytes stay
//! for the life of the process.

mod aarch64;
mod arena;

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;

use log::{debug, info};
use once_cell::sync::Lazy;

use crate::errors::HookError;

pub use aarch64::TrampolineConfig;
pub use arena::CodeArena;

use arena::Reach;

static GLOBAL_ARENA: Lazy<Arc<CodeArena>> = Lazy::new(|| Arc::new(CodeArena::new()));

/// How many branch hops [`resolve_plt`] follows before giving up on finding
/// a fixed point.
const MAX_PLT_HOPS: usize = 16;

/// Installs trampolines over function prologues.
pub struct Hooker {
    arena: Arc<CodeArena>,
}

impl Hooker {
    /// A hooker backed by the process-wide code arena.
    pub fn new() -> Self {
        Hooker { arena: Arc::clone(&GLOBAL_ARENA) }
    }

    /// A hooker backed by its own arena. Lets tests keep published code out
    /// of process-global state.
    pub fn with_arena(arena: Arc<CodeArena>) -> Self {
        Hooker { arena }
    }

    /// Redirect `original` to `interceptor`, picking the shortest trampoline
    /// that can encode the jump.
    ///
    /// # Safety
    ///
    /// `original` must be the entry of a function at least as long as the
    /// chosen trampoline, mapped readable; no thread may be executing its
    /// prologue during the patch.
    pub unsafe fn install(
        &self,
        original: *const c_void,
        interceptor: *const c_void,
    ) -> Result<Hook, HookError> {
        self.install_with_config(
            original,
            interceptor,
            TrampolineConfig::select(interceptor as u64),
        )
    }

    /// Like [`install`](Self::install) but with a caller-chosen trampoline
    /// configuration, for callers that know their code layout.
    ///
    /// # Safety
    ///
    /// As [`install`](Self::install).
    pub unsafe fn install_with_config(
        &self,
        original: *const c_void,
        interceptor: *const c_void,
        config: TrampolineConfig,
    ) -> Result<Hook, HookError> {
        if !config.encodes(interceptor as u64) {
            return Err(HookError::OutOfRangeTarget(interceptor as u64));
        }

        let entry = original as u64;
        let quota = config.len();
        let window = std::slice::from_raw_parts(original as *const u32, quota / 4);
        let relocation = aarch64::relocate_prologue(window, entry, quota)?;
        debug!(
            "hooking {entry:#x}: displaced {} bytes, {:?} trampoline",
            relocation.displaced, config
        );

        let reach = if entry < 1 << 32 && (interceptor as u64) < 1 << 32 {
            Reach::Low
        } else {
            Reach::Any
        };
        let trampoline = self.arena.publish(&relocation.code, reach)?;

        let patch = aarch64::entry_patch(config, interceptor as u64);
        if let Err(err) = patch_entry(original as *mut u8, &patch) {
            self.arena.discard(trampoline);
            return Err(err);
        }

        info!("installed hook at {entry:#x} -> {:#x}", interceptor as u64);
        Ok(Hook {
            entry,
            trampoline,
            displaced: relocation.displaced,
            config,
        })
    }
}

impl Default for Hooker {
    fn default() -> Self {
        Self::new()
    }
}

/// An installed hook. Dropping it does not restore the original code; the
/// record exists so the interceptor can call through to the unhooked
/// function.
#[derive(Debug)]
pub struct Hook {
    entry: u64,
    trampoline: NonNull<u8>,
    displaced: usize,
    config: TrampolineConfig,
}

// The trampoline pointer is immutable published code.
unsafe impl Send for Hook {}
unsafe impl Sync for Hook {}

impl Hook {
    /// Entry address of the hooked function.
    pub fn entry(&self) -> u64 {
        self.entry
    }

    /// A callable with the original function's signature and behaviour:
    /// executes the displaced prologue, then the rest of the original body.
    pub fn trampoline(&self) -> *const c_void {
        self.trampoline.as_ptr() as *const c_void
    }

    /// How many bytes of the original prologue were displaced.
    pub fn displaced_len(&self) -> usize {
        self.displaced
    }

    pub fn config(&self) -> TrampolineConfig {
        self.config
    }
}

/// Follow PLT-style thunks — a single unconditional branch — to the function
/// they forward to. Addresses that do not start with such a branch come back
/// unchanged, which makes the operation idempotent.
///
/// # Safety
///
/// `addr` and every branch target reached from it must point at readable,
/// 4-byte aligned code.
pub unsafe fn resolve_plt(addr: *const c_void) -> *const c_void {
    let mut current = addr as u64;
    for _ in 0..MAX_PLT_HOPS {
        let word = std::ptr::read(current as *const u32);
        match aarch64::branch_target(word, current) {
            Some(target) if target != current => current = target,
            _ => break,
        }
    }
    current as *const c_void
}

/// Overwrite a function entry with the trampoline bytes: pages go writable,
/// the patch lands, protection returns to read-execute and the instruction
/// cache is flushed.
unsafe fn patch_entry(entry: *mut u8, patch: &[u8]) -> Result<(), HookError> {
    #[cfg(unix)]
    {
        let page = arena::page_size();
        let start = (entry as usize) & !(page - 1);
        let len = (entry as usize + patch.len()) - start;
        let len = arena::round_to_pages(len);

        let rwx = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;
        if libc::mprotect(start as *mut libc::c_void, len, rwx) != 0 {
            return Err(HookError::Protection(std::io::Error::last_os_error()));
        }
        std::ptr::copy_nonoverlapping(patch.as_ptr(), entry, patch.len());
        let rx = libc::PROT_READ | libc::PROT_EXEC;
        if libc::mprotect(start as *mut libc::c_void, len, rx) != 0 {
            return Err(HookError::Protection(std::io::Error::last_os_error()));
        }
        arena::flush_instruction_cache(entry as *const u8, patch.len());
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = (entry, patch);
        Err(HookError::Protection(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "code patching is only implemented for unix targets",
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// B #+8, twice, then a RET: a two-hop thunk chain laid out in data.
    #[test]
    fn resolve_plt_follows_branch_chains_to_a_fixed_point() {
        let code: [u32; 3] = [
            0x1400_0002, // B +8
            0xD65F_03C0, // RET (never reached through the chain)
            0xD65F_03C0, // RET
        ];
        let base = code.as_ptr() as *const c_void;
        let resolved = unsafe { resolve_plt(base) };
        assert_eq!(resolved as usize, base as usize + 8);
        // Idempotence: resolving a resolved address is a no-op.
        let again = unsafe { resolve_plt(resolved) };
        assert_eq!(again, resolved);
    }

    #[test]
    fn resolve_plt_leaves_ordinary_prologues_alone() {
        let code: [u32; 2] = [0xD280_0540, 0xD65F_03C0]; // MOV X0, #42; RET
        let base = code.as_ptr() as *const c_void;
        assert_eq!(unsafe { resolve_plt(base) }, base);
    }

    #[test]
    fn resolve_plt_tolerates_self_branches() {
        let code: [u32; 1] = [0x1400_0000]; // B .
        let base = code.as_ptr() as *const c_void;
        assert_eq!(unsafe { resolve_plt(base) }, base);
    }

    #[test]
    fn forced_narrow_config_rejects_high_interceptor() {
        let hooker = Hooker::with_arena(Arc::new(CodeArena::new()));
        let err = unsafe {
            hooker.install_with_config(
                0x1000 as *const c_void,
                0x7F00_0000_0000 as *const c_void,
                TrampolineConfig::First4G,
            )
        }
        .unwrap_err();
        assert!(matches!(err, HookError::OutOfRangeTarget(_)));
    }

    // End-to-end hooking needs to execute generated code, so it only runs on
    // the architecture the rewriter targets.
    #[cfg(all(target_arch = "aarch64", unix))]
    mod native {
        use super::*;

        type LeafFn = unsafe extern "C" fn() -> u64;

        /// Synthesise `MOV X0, #42; RET` as a callable function.
        fn make_leaf(arena: &CodeArena) -> *const c_void {
            let mut bytes = Vec::new();
            for word in [0xD280_0540u32, 0xD65F_03C0] {
                bytes.extend_from_slice(&word.to_le_bytes());
            }
            // Pad so the full trampoline patch stays inside the allocation.
            bytes.extend_from_slice(&[0u8; 16]);
            arena.publish(&bytes, super::super::arena::Reach::Any).unwrap().as_ptr()
                as *const c_void
        }

        unsafe extern "C" fn interceptor() -> u64 {
            7
        }

        #[test]
        fn hooked_leaf_diverts_and_trampoline_preserves_original() {
            let _ = pretty_env_logger::try_init();
            let arena = Arc::new(CodeArena::new());
            let target = make_leaf(&arena);

            let original: LeafFn = unsafe { std::mem::transmute(target) };
            assert_eq!(unsafe { original() }, 42);

            let hooker = Hooker::with_arena(Arc::clone(&arena));
            let hook = unsafe { hooker.install(target, interceptor as *const c_void) }.unwrap();

            let hooked: LeafFn = unsafe { std::mem::transmute(target) };
            assert_eq!(unsafe { hooked() }, 7);

            let through: LeafFn = unsafe { std::mem::transmute(hook.trampoline()) };
            assert_eq!(unsafe { through() }, 42);
        }
    }
}
