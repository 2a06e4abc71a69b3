//! Launching and supervising sandboxed guest processes.

mod chain;
mod drain;
mod launcher;
mod state;
mod table;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use chain::*;
pub use drain::*;
pub use launcher::*;
pub use state::*;
pub use table::*;
