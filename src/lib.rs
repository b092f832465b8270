//! Guest-RAM mapping and a stackful coroutine runtime for a machine
//! emulator's host-utility layer.
//!
//! Two independent pieces live here, sharing no state (see SPEC_FULL.md
//! §2): [`ram`] maps and unmaps page-aligned, guard-protected host memory
//! that backs guest physical RAM, and [`coroutine`] schedules cooperative
//! stackful coroutines on top of it (coroutine stacks are themselves
//! obtained through `ram::map`). [`context`] and [`sys`] are the platform
//! glue both of those depend on; [`error`] holds the one typed error this
//! crate returns.

pub mod context;
pub mod coroutine;
pub mod error;
pub mod ram;
pub mod sys;

pub use coroutine::{CoMutex, Coroutine, CoroutineContext, Scheduler};
pub use error::MapError;
pub use ram::GuestRam;
