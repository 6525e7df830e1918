//! Process-level controls: backgrounding, privilege dropping and
//! termination requests.
//!
//! These are hidden behind [`ProcessController`] so the binary's startup
//! sequence can be tested without forking or changing credentials.  The
//! shipped [`ForegroundProcess`] supports termination only; platforms that
//! need daemonising plug in their own controller.

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::info;

use crate::infrastructure::event_loop::ShutdownHandle;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessError {
    #[error("{0} is not supported by this process controller")]
    Unsupported(&'static str),

    #[error("process control failed: {0}")]
    Failed(String),
}

#[cfg_attr(test, mockall::automock)]
pub trait ProcessController: Send + Sync {
    /// Detaches from the controlling terminal.
    fn run_in_background(&self) -> Result<(), ProcessError>;

    /// Switches the process to `uid`/`gid`.
    fn drop_privileges(&self, uid: u32, gid: u32) -> Result<(), ProcessError>;

    /// Whether termination has been requested (signal or console event).
    fn termination_requested(&self) -> bool;
}

/// Requested process options, resolved from file, flags and environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOptions {
    pub background: bool,
    /// `(uid, gid)` to switch to after the listener is bound.
    pub identity: Option<(u32, u32)>,
}

/// Applies `options` through `controller`, backgrounding first.
pub fn apply_process_options(
    controller: &dyn ProcessController,
    options: &ProcessOptions,
) -> Result<(), ProcessError> {
    if options.background {
        controller.run_in_background()?;
        info!("running in background");
    }
    if let Some((uid, gid)) = options.identity {
        controller.drop_privileges(uid, gid)?;
        info!(uid, gid, "dropped privileges");
    }
    Ok(())
}

/// Controller for a process that stays attached to its terminal.
///
/// [`request_termination`](Self::request_termination) is the signal path:
/// it records the request and stops the event loop.
#[derive(Debug)]
pub struct ForegroundProcess {
    terminate: AtomicBool,
    shutdown: ShutdownHandle,
}

impl ForegroundProcess {
    pub fn new(shutdown: ShutdownHandle) -> Self {
        Self {
            terminate: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn request_termination(&self) {
        self.terminate.store(true, Ordering::SeqCst);
        self.shutdown.shutdown();
    }
}

impl ProcessController for ForegroundProcess {
    fn run_in_background(&self) -> Result<(), ProcessError> {
        Err(ProcessError::Unsupported("running in background"))
    }

    fn drop_privileges(&self, _uid: u32, _gid: u32) -> Result<(), ProcessError> {
        Err(ProcessError::Unsupported("dropping privileges"))
    }

    fn termination_requested(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
