//! `deckutils` is a library containing the leaf utilities of the deckcore project: archive
//! extraction, in-place ELF patching, process resource sampling and per-process output logs.

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

pub mod archive;
pub mod elf;
pub mod error;
pub mod log;
pub mod path;
pub mod proc;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use archive::*;
pub use elf::*;
pub use error::*;
pub use log::*;
pub use path::*;
pub use proc::*;
