use serde::Deserialize;
use std::path::PathBuf;

use privd_protocol::paths;

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(default = "paths::default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "paths::default_data_dir")]
    pub data_dir: PathBuf,
    /// Uid of the single principal the broker always trusts.
    #[serde(default = "default_manager_uid")]
    pub manager_uid: u32,
}

impl ServerConfig {
    pub fn load() -> anyhow::Result<Self> {
        // Try to load from config file, fall back to defaults
        let config_path = paths::config_path();
        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: paths::default_socket_path(),
            data_dir: paths::default_data_dir(),
            manager_uid: default_manager_uid(),
        }
    }
}

fn default_manager_uid() -> u32 {
    // SAFETY: getuid() is always safe to call and has no preconditions
    unsafe { libc::getuid() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_in_defaults() {
        let config: ServerConfig = toml::from_str("manager_uid = 1234").unwrap();
        assert_eq!(config.manager_uid, 1234);
        assert_eq!(config.socket_path, paths::default_socket_path());
        assert_eq!(config.data_dir, paths::default_data_dir());
    }

    #[test]
    fn full_config_round_trip() {
        let config: ServerConfig = toml::from_str(
            "socket_path = \"/run/privd/privd.sock\"\n\
             data_dir = \"/var/lib/privd\"\n\
             manager_uid = 1000\n",
        )
        .unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/run/privd/privd.sock"));
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/privd"));
        assert_eq!(config.manager_uid, 1000);
    }
}
