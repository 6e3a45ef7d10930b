//! Process lifecycle and output synchronization
//!
//! Spawns external processes, captures their output line by line, and
//! lets callers block until a given line shows up.

mod expect;
mod handle;
mod log;
mod scope;

pub use expect::{await_pattern, LogExpectation};
pub use handle::{spawn, ProcessHandle, ProcessSpec};
pub use log::{LogState, OutputLog};
pub use scope::{ProcessOutput, ProcessScope};
