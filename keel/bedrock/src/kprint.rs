//! Kernel print utilities.
//!
//! Messages are routed to the [`log`] facade under one target per kernel
//! subsystem, so a host logger can filter them by subsystem. Each subsystem
//! can also be silenced at the source with [`set_debug_flags`].

use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};

bitflags! {
    /// Debug categories, one per kernel subsystem.
    pub struct DebugFlags: u32 {
        /// Thread lifecycle and scheduling decisions.
        const THREAD = 1 << 0;
        /// Synchronization primitives.
        const SYNC = 1 << 1;
        /// Interrupt delivery and timers.
        const INTERRUPT = 1 << 2;
        /// Messages from test drivers and demo workloads.
        const TEST = 1 << 3;
        /// Machine power state.
        const MACHINE = 1 << 4;
    }
}

impl DebugFlags {
    /// Log target of this category.
    pub fn target(self) -> &'static str {
        if self == Self::THREAD {
            "keel::thread"
        } else if self == Self::SYNC {
            "keel::sync"
        } else if self == Self::INTERRUPT {
            "keel::interrupt"
        } else if self == Self::TEST {
            "keel::test"
        } else {
            "keel::machine"
        }
    }
}

static ENABLED: AtomicU32 = AtomicU32::new(DebugFlags::all().bits());

/// Sets the categories whose messages are emitted.
pub fn set_debug_flags(flags: DebugFlags) {
    ENABLED.store(flags.bits(), Ordering::SeqCst);
}

#[doc(hidden)]
pub fn enabled(flag: DebugFlags) -> bool {
    DebugFlags::from_bits_truncate(ENABLED.load(Ordering::Relaxed)).contains(flag)
}

/// Display an information message.
///
/// The first argument names the [`DebugFlags`] category.
#[macro_export]
macro_rules! info {
    ($flag:ident, $($arg:tt)+) => {
        if $crate::kprint::enabled($crate::kprint::DebugFlags::$flag) {
            $crate::log::info!(target: $crate::kprint::DebugFlags::$flag.target(), $($arg)+)
        }
    };
}

/// Display a warning message.
///
/// The first argument names the [`DebugFlags`] category.
#[macro_export]
macro_rules! warning {
    ($flag:ident, $($arg:tt)+) => {
        if $crate::kprint::enabled($crate::kprint::DebugFlags::$flag) {
            $crate::log::warn!(target: $crate::kprint::DebugFlags::$flag.target(), $($arg)+)
        }
    };
}

/// Display a debug message.
///
/// The first argument names the [`DebugFlags`] category.
#[macro_export]
macro_rules! debug {
    ($flag:ident, $($arg:tt)+) => {
        if $crate::kprint::enabled($crate::kprint::DebugFlags::$flag) {
            $crate::log::debug!(target: $crate::kprint::DebugFlags::$flag.target(), $($arg)+)
        }
    };
}

/// Display a trace message, for messages on hot paths such as every tick.
#[macro_export]
macro_rules! trace {
    ($flag:ident, $($arg:tt)+) => {
        if $crate::kprint::enabled($crate::kprint::DebugFlags::$flag) {
            $crate::log::trace!(target: $crate::kprint::DebugFlags::$flag.target(), $($arg)+)
        }
    };
}
