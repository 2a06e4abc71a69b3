//! Command-line interface of the `deck` binary.

mod args;
pub mod styles;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use args::*;
