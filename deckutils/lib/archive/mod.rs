//! Streaming extraction of the compressed tarballs bundled with the application.

mod extract;
mod format;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use extract::*;
pub use format::*;
