//! Central path resolution for all OrbitDock data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `ORBITDOCK_DATA_DIR`
//! env > `~/.orbitdock`. All callsites use these helpers instead of
//! constructing paths from `HOME`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Initialize the global data directory. Returns the resolved path.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = if let Some(p) = explicit {
        p.to_path_buf()
    } else if let Ok(env_val) = std::env::var("ORBITDOCK_DATA_DIR") {
        PathBuf::from(env_val)
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".orbitdock")
    };

    let mut guard = DATA_DIR.write().unwrap_or_else(|poison| poison.into_inner());
    *guard = Some(dir.clone());
    dir
}

/// Return the current data directory. Falls back to the default when
/// `init_data_dir` has not been called (tests, library use).
pub fn data_dir() -> PathBuf {
    if let Some(dir) = DATA_DIR
        .read()
        .unwrap_or_else(|poison| poison.into_inner())
        .clone()
    {
        return dir;
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".orbitdock")
}

pub fn db_path() -> PathBuf {
    data_dir().join("orbitdock.db")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

pub fn hook_script_path() -> PathBuf {
    data_dir().join("hook.sh")
}

pub fn pid_file_path() -> PathBuf {
    data_dir().join("orbitdock.pid")
}

pub fn token_file_path() -> PathBuf {
    data_dir().join("auth-token")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}
