//! Configuration types and helpers.

mod container;
mod deck;
mod defaults;
mod policy;
mod settings;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use container::*;
pub use deck::*;
pub use defaults::*;
pub use policy::*;
pub use settings::*;
