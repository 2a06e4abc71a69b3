//! `deckcore` prepares Windows compatibility containers and supervises the games launched inside
//! them.
//!
//! # Overview
//!
//! A guest Windows executable runs through a chain of programs: a user-space sandbox that fakes
//! a Linux root filesystem, a binary translator that runs x86-64 code on ARM64, and a Windows
//! compatibility layer whose prefix is the container. deckcore owns everything below the UI:
//!
//! - Installing the runtime image from bundled archives and patching the translator binaries
//! - Creating containers and driving the compatibility layer's first-run initialization
//! - Launching guest executables and reporting their status until they exit
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use deckcore::{config::DeckConfig, management::DirAssetSource, DeckEngine};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = DeckConfig::load_default().await?;
//!     let engine = DeckEngine::new(config, Arc::new(DirAssetSource::new("/sdcard/deck-assets")));
//!
//!     if !engine.is_available().await {
//!         engine.initialize(Arc::new(|_: f32, _: &str| {})).await?;
//!     }
//!
//!     let container = engine.default_container().await?;
//!     let process = engine
//!         .launch_executable(&container, "/sdcard/games/game.exe", &[])
//!         .await?;
//!
//!     let mut statuses = Box::pin(engine.monitor_process(process.get_id(), Duration::from_secs(1)));
//!     while let Some(status) = statuses.next().await {
//!         println!("{}", status?.get_state());
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`cli`] - Command-line interface and argument parsing
//! - [`config`] - Runtime, container and timing configuration
//! - [`environment`] - The environment handed to sandboxed processes
//! - [`management`] - Runtime install, container lifecycle and bootstrap
//! - [`runtime`] - The sandbox chain and guest process supervision
//! - [`utils`] - Path and environment helpers

#![warn(missing_docs)]

mod engine;
mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod cli;
pub mod config;
pub mod environment;
pub mod management;
pub mod runtime;
pub mod utils;

pub use engine::*;
pub use error::*;
