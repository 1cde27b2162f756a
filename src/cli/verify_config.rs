// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use clap::Parser;
use log::info;

use super::{display_params, read_config, CorrelatorError};

#[derive(Parser, Debug, Clone, Default)]
pub(super) struct VerifyConfigArgs {
    /// Path to the configuration file (toml or json).
    #[clap(name = "CONFIG_FILE", parse(from_os_str))]
    config: PathBuf,
}

impl VerifyConfigArgs {
    pub(super) fn run(self, save_toml: Option<&Path>) -> Result<(), CorrelatorError> {
        let params = read_config(Some(&self.config), save_toml)?;
        display_params(&params);
        info!("{} is valid", self.config.display());
        Ok(())
    }
}
