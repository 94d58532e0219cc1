//! Standard locations of blockpump files

use std::path::PathBuf;

/// Per-user config directory: `~/.config/blockpump` on Linux
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("blockpump")
}

/// Default pipeline config file: `~/.config/blockpump/config.yaml`
pub fn default_config_path() -> PathBuf {
    config_dir().join("config.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("blockpump/config.yaml"));
    }
}
