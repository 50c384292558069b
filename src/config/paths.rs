//! Where tale-audio keeps its files.
//!
//! | file            | location                                |
//! |-----------------|-----------------------------------------|
//! | `settings.toml` | `dirs::config_dir()/tale-audio/`        |
//! | installed audio | `dirs::data_dir()/tale-audio/assets/`   |
//!
//! A platform without one of these roots gets the working directory.

use std::path::{Path, PathBuf};

const APP_DIR: &str = "tale-audio";
const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub settings_file: PathBuf,
    /// Used for relative locators when `assets.root_dir` is left empty.
    pub assets_dir: PathBuf,
}

impl AppPaths {
    pub fn new() -> Self {
        Self::under(dirs::config_dir(), dirs::data_dir())
    }

    fn under(config_root: Option<PathBuf>, data_root: Option<PathBuf>) -> Self {
        let app_dir = |root: Option<PathBuf>| root.unwrap_or_else(|| PathBuf::from(".")).join(APP_DIR);
        let config_dir = app_dir(config_root);
        Self {
            settings_file: config_dir.join(SETTINGS_FILE),
            assets_dir: app_dir(data_root).join("assets"),
            config_dir,
        }
    }

    /// The configured assets root, or [`assets_dir`](Self::assets_dir) when
    /// none is configured.
    pub fn assets_root(&self, configured: &Path) -> PathBuf {
        if configured.as_os_str().is_empty() {
            self.assets_dir.clone()
        } else {
            configured.to_path_buf()
        }
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_live_under_the_app_dirs() {
        let paths = AppPaths::under(Some("/cfg".into()), Some("/data".into()));
        assert_eq!(paths.settings_file, PathBuf::from("/cfg/tale-audio/settings.toml"));
        assert_eq!(paths.assets_dir, PathBuf::from("/data/tale-audio/assets"));
    }

    #[test]
    fn missing_roots_use_working_dir() {
        let paths = AppPaths::under(None, None);
        assert!(paths.config_dir.starts_with("."));
        assert!(paths.assets_dir.starts_with("."));
    }

    #[test]
    fn empty_assets_root_means_installed_assets() {
        let paths = AppPaths::under(Some("/cfg".into()), Some("/data".into()));
        assert_eq!(paths.assets_root(Path::new("")), paths.assets_dir);
        assert_eq!(paths.assets_root(Path::new("book/audio")), PathBuf::from("book/audio"));
    }
}
