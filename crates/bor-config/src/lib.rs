//! INI config loading (`bor.conf`) and the browser-descriptor parsing that
//! turns `[browsers]` entries into `bor_core::Browser` values. Kept as its
//! own crate so `bor-core` never needs to depend on an INI parser or know
//! about shell scripts.

pub mod config;
pub mod descriptor;
pub mod error;

pub use config::Config;
pub use descriptor::{load_browsers, BrowserDescriptor, BrowserDescriptorSource, ShellScriptDescriptorSource};
pub use error::ConfigError;

use std::path::Path;

use ini::Ini;

/// Loads both the `[config]` and `[browsers]` sections of `path` in one
/// pass, running each browser's descriptor script through `source`.
pub fn load(path: &Path, source: &dyn BrowserDescriptorSource) -> Result<(Config, Vec<bor_core::Browser>), ConfigError> {
    let config = Config::load(path)?;
    let ini = Ini::load_from_file(path).map_err(|source| ConfigError::MalformedIni { path: path.to_path_buf(), source })?;
    let browsers = load_browsers(&ini, source)?;
    Ok((config, browsers))
}
