//! Daemon control block updated from signal context.
//!
//! Signal handlers must not take locks, so the whole block is lock-free
//! atomics. A dedicated signal thread owns the blocking wait and translates
//! raw signals into control-block stores; daemon threads only ever read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::Signals;

use crate::error::{MdnError, MdnResult};

/// Shared daemon control state.
#[derive(Debug, Default)]
pub struct DaemonControl {
    shutdown: AtomicBool,
    debug_dump: AtomicBool,
    debug_mode: AtomicBool,
}

impl DaemonControl {
    /// Creates an idle control block.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Requests cooperative shutdown of all daemon threads.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Arms the one-shot debug dump.
    pub fn request_debug_dump(&self) {
        self.debug_dump.store(true, Ordering::Release);
    }

    /// Consumes the one-shot debug dump request, if armed.
    #[must_use]
    pub fn take_debug_dump(&self) -> bool {
        self.debug_dump.swap(false, Ordering::AcqRel)
    }

    /// Toggles verbose debug mode and returns the new value.
    pub fn toggle_debug_mode(&self) -> bool {
        !self.debug_mode.fetch_xor(true, Ordering::AcqRel)
    }

    /// Whether verbose per-message tracing is enabled.
    #[must_use]
    pub fn debug_mode(&self) -> bool {
        self.debug_mode.load(Ordering::Acquire)
    }
}

/// Starts the dedicated signal thread feeding one control block.
///
/// SIGHUP/SIGINT/SIGTERM/SIGQUIT request shutdown and end the thread;
/// SIGUSR1 arms a one-shot debug dump; SIGUSR2 toggles debug mode.
///
/// # Errors
///
/// Returns `MdnError::Io` when signal registration or thread spawn fails.
pub fn spawn_signal_thread(control: Arc<DaemonControl>) -> MdnResult<JoinHandle<()>> {
    let mut signals = Signals::new([SIGHUP, SIGINT, SIGTERM, SIGQUIT, SIGUSR1, SIGUSR2])
        .map_err(|error| MdnError::Io(format!("register signal set failed: {error}")))?;

    thread::Builder::new()
        .name("mdn-signals".to_owned())
        .spawn(move || {
            for signal in signals.forever() {
                match signal {
                    SIGUSR1 => control.request_debug_dump(),
                    SIGUSR2 => {
                        let enabled = control.toggle_debug_mode();
                        log::info!(
                            "debug mode {}",
                            if enabled { "enabled" } else { "disabled" }
                        );
                    }
                    _ => {
                        log::error!("interrupted: exiting");
                        control.request_shutdown();
                        return;
                    }
                }
            }
        })
        .map_err(|error| MdnError::Io(format!("spawn signal thread failed: {error}")))
}

#[cfg(test)]
mod tests {
    use super::DaemonControl;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn shutdown_latches() {
        let control = DaemonControl::new();
        assert_that!(control.shutdown_requested(), eq(false));
        control.request_shutdown();
        assert_that!(control.shutdown_requested(), eq(true));
        control.request_shutdown();
        assert_that!(control.shutdown_requested(), eq(true));
    }

    #[rstest]
    fn debug_dump_is_one_shot() {
        let control = DaemonControl::new();
        control.request_debug_dump();
        assert_that!(control.take_debug_dump(), eq(true));
        assert_that!(control.take_debug_dump(), eq(false));
    }

    #[rstest]
    fn debug_mode_toggles() {
        let control = DaemonControl::new();
        assert_that!(control.debug_mode(), eq(false));
        assert_that!(control.toggle_debug_mode(), eq(true));
        assert_that!(control.debug_mode(), eq(true));
        assert_that!(control.toggle_debug_mode(), eq(false));
        assert_that!(control.debug_mode(), eq(false));
    }
}
