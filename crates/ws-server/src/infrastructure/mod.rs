//! Infrastructure layer for ws-server.
//!
//! OS-facing adapters: the `mio` event loop and its TCP sockets, the TOML
//! configuration file, and process controls.
//!
//! **Dependency rule**: this layer may depend on `application`, `domain` and
//! `ws_core`, but MUST NOT be imported by the `application` or `domain`
//! layers.

pub mod config_file;
pub mod event_loop;
pub mod process;
pub mod tcp;

pub use config_file::{load_config, ConfigFileError, FileConfig};
pub use event_loop::{EventLoop, ShutdownHandle};
pub use process::{apply_process_options, ForegroundProcess, ProcessController, ProcessOptions};
