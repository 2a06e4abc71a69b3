//! Computes the environment handed to every sandboxed process.
//!
//! Nothing here touches the filesystem; the builder maps a container, a bootstrap attempt (or
//! steady-state mode) and the container's settings to a variable map.

mod builder;
mod tuning;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use builder::*;
pub use tuning::*;
