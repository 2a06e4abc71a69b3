//! Per-process output logs.

mod process_log;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use process_log::*;
