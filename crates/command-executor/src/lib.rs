//! Process lifecycle management for local services
//!
//! [`LocalLauncher`] spawns one OS process per service command, starts a
//! drain task per output stream immediately after spawning (so a chatty
//! child never blocks on a full pipe), and hands back an opaque
//! [`ServiceProcess`] handle. A reaper task owns the child and publishes
//! its exit status through an [`ExitWatch`] that any number of observers
//! can await.
//!
//! One-shot commands (health-check commands, hooks) go through
//! [`execute`], which enforces a hard timeout and honours cancellation.

pub mod backends;
pub mod command;
pub mod error;
pub mod event;
pub mod executor;
pub mod launcher;
pub mod output;
pub mod process;

pub use backends::LocalLauncher;
pub use command::Command;
pub use error::{Error, Result};
pub use event::{LogSource, OutputLine};
pub use executor::{execute, ExecuteOptions, ExitResult, DEFAULT_EXECUTE_TIMEOUT};
pub use launcher::Launcher;
pub use output::OutputBuffer;
pub use process::{kill_pid, process_alive, terminate_pid, ExitStatus, ExitWatch, ServiceProcess};
