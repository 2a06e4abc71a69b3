use std::path::PathBuf;

use crate::{config::DEFAULT_DECK_HOME, utils::DECK_HOME_ENV_VAR};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the deck home directory, honouring `DECK_HOME` when it is set.
pub fn get_deck_home_path() -> PathBuf {
    match std::env::var_os(DECK_HOME_ENV_VAR) {
        Some(home) if !home.is_empty() => PathBuf::from(home),
        _ => DEFAULT_DECK_HOME.to_path_buf(),
    }
}
