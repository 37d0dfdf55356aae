use std::fs;
use std::path::PathBuf;

use directories::ProjectDirs;

use crate::common::error::Result;
use crate::common::paths;

#[derive(Debug, Clone)]
pub struct DevMode {
    enabled: bool,
    base_dir: PathBuf,
}

impl DevMode {
    pub fn new(enabled: bool) -> Result<Self> {
        Self::with_base_dir(enabled, PathBuf::from("./dev_data"))
    }

    pub fn with_base_dir(enabled: bool, base_dir: PathBuf) -> Result<Self> {
        if enabled {
            fs::create_dir_all(&base_dir)?;
            fs::create_dir_all(base_dir.join("captures"))?;
            fs::create_dir_all(base_dir.join("config"))?;

            tracing::info!("Development mode enabled - data will be saved to: {}", base_dir.display());
        }

        Ok(Self { enabled, base_dir })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// JSON file backing the shared credential slot.
    pub fn credentials_file(&self) -> PathBuf {
        if self.enabled {
            self.base_dir.join("credentials.json")
        } else {
            paths::system_credentials_file()
        }
    }

    pub fn config_file(&self) -> PathBuf {
        if self.enabled {
            PathBuf::from("configs/homeface.toml")
        } else {
            paths::system_config_file()
        }
    }

    pub fn agent_socket(&self) -> PathBuf {
        if self.enabled {
            PathBuf::from("/tmp/homeface-agent.sock")
        } else {
            paths::system_agent_socket()
        }
    }

    pub fn captures_dir(&self) -> PathBuf {
        if self.enabled {
            self.base_dir.join("captures")
        } else {
            ProjectDirs::from("in", "iobroker", "homeface")
                .map(|dirs| dirs.data_dir().join("captures"))
                .unwrap_or_else(|| PathBuf::from("."))
        }
    }

    pub fn get_capture_path(&self, prefix: &str, index: usize) -> PathBuf {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        self.captures_dir()
            .join(format!("{}_{}_{}.jpg", prefix, timestamp, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_paths_stay_under_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let dev = DevMode::with_base_dir(true, dir.path().to_path_buf()).unwrap();

        assert!(dev.credentials_file().starts_with(dir.path()));
        assert!(dev.captures_dir().is_dir());
        assert!(dev.get_capture_path("enroll", 2).to_string_lossy().ends_with("_2.jpg"));
    }

    #[test]
    fn production_paths_use_system_locations() {
        let dev = DevMode::new(false).unwrap();
        assert_eq!(dev.credentials_file(), paths::system_credentials_file());
        assert_eq!(dev.agent_socket(), paths::system_agent_socket());
    }
}
