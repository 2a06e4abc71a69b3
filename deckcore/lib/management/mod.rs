//! Runtime installation and container lifecycle.
//!
//! [`RuntimeInstaller`] brings up the translator, sandbox and compatibility layer once per
//! device. [`ContainerManager`] creates containers on top of that runtime, running the
//! [`Bootstrapper`] state machine and the [`PostBootstrap`] steps for each new one.

mod bootstrap;
mod cache;
mod container;
mod download;
mod install;
mod layout;
mod registry;
mod steps;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use bootstrap::*;
pub use cache::*;
pub use container::*;
pub use download::*;
pub use install::*;
pub use layout::*;
pub use registry::*;
pub use steps::*;
