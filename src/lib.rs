//! In-process graphics driver interception.
//!
//! Three pieces, usable separately:
//!
//! - [`resolver`] locates real driver entry points (EGL/GLES, Vulkan) even
//!   when the current process carries its own shims for them.
//! - [`hook`] redirects a function to an interceptor by patching a trampoline
//!   over its prologue, keeping the original callable through a relocated
//!   copy of the displaced instructions.
//! - [`swapchain`] is a Vulkan swapchain without a display: rendered frames
//!   are copied out and delivered to a byte sink, with optional mirroring
//!   onto a real swapchain.

pub mod errors;
pub mod hook;
pub mod resolver;
pub mod swapchain;

pub use errors::HookError;
pub use hook::{resolve_plt, CodeArena, Hook, Hooker, TrampolineConfig};
pub use resolver::{Capability, DriverSearch, Resolver};
pub use swapchain::{BaseTarget, FrameSink, SwapchainOptions, VirtualSwapchain};
