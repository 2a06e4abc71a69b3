//! In-place patching of the translator binaries' ELF headers.
//!
//! Every operation reads the current value first and only writes when it differs, so the
//! patches can be re-applied on each environment bring-up without touching already patched
//! files.

mod patch;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use patch::*;
