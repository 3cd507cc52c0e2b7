use std::path::PathBuf;

/// Returns the default socket path for the privd broker.
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("privd.sock")
    } else {
        // SAFETY: getuid() is always safe to call and has no preconditions
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/privd-{uid}.sock"))
    }
}

/// Returns the config directory path for privd.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("privd")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("privd")
    } else {
        PathBuf::from("/tmp/privd")
    }
}

/// Returns the default directory for persistent broker state.
pub fn default_data_dir() -> PathBuf {
    if let Ok(state_dir) = std::env::var("XDG_STATE_HOME") {
        PathBuf::from(state_dir).join("privd")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local").join("state").join("privd")
    } else {
        // SAFETY: getuid() is always safe to call and has no preconditions
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/privd-{uid}"))
    }
}

/// Returns the default PID file path for the privd broker.
pub fn pid_file_path() -> PathBuf {
    dirs_path().join("privd.pid")
}

/// Returns the config file path for the privd broker.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}
