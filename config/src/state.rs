// SPDX-License-Identifier: MPL-2.0

use cosmic_config::{Config, CosmicConfigEntry, cosmic_config_derive::CosmicConfigEntry};
use derive_setters::Setters;
use serde::{Deserialize, Serialize};

use crate::NAME;

#[derive(Default, Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Setters, CosmicConfigEntry)]
#[serde(deny_unknown_fields)]
#[must_use]
pub struct State {
    /// Id of the asset that last started playing
    pub last_played: Option<String>,
    /// Id of the asset the session is playing, if any
    pub current: Option<String>,
    /// Most recent playback failure, as `asset id: reason`
    pub last_failure: Option<String>,
}

impl State {
    pub fn version() -> u64 {
        1
    }

    pub fn state() -> Result<Config, cosmic_config::Error> {
        Config::new_state(NAME, Self::version())
    }

    /// Read the current state, apply `update`, and write it back.
    ///
    /// # Errors
    ///
    /// Fails if the state directory cannot be opened or written.
    pub fn modify(update: impl FnOnce(&mut State)) -> Result<(), cosmic_config::Error> {
        let helper = Self::state()?;
        let mut state = Self::get_entry(&helper).unwrap_or_else(|(_, partial)| partial);
        update(&mut state);
        state.write_entry(&helper)
    }
}
