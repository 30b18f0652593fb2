use thiserror::Error;

/// Reasons an `install` call can fail. A failed install leaves the target
/// function untouched and releases any arena pages it had claimed.
#[derive(Debug, Error)]
pub enum HookError {
    /// The prologue contains an opcode the rewriter does not know how to
    /// relocate.
    #[error("unhandled instruction {word:#010x} at entry offset {offset}")]
    UnhandledInstruction { word: u32, offset: usize },

    /// Every candidate scratch register is read or written by the displaced
    /// prologue.
    #[error("prologue reserves every scratch register candidate")]
    NoFreeScratchRegister,

    /// The interceptor address cannot be encoded by the requested trampoline
    /// configuration.
    #[error("interceptor at {0:#x} is out of range for the requested trampoline")]
    OutOfRangeTarget(u64),

    /// The code arena could not supply executable pages.
    #[error("code arena cannot supply {0} executable bytes")]
    ArenaExhausted(usize),

    /// Changing the protection of the target code pages failed.
    #[error("failed to change code page protection: {0}")]
    Protection(#[source] std::io::Error),
}
