use std::env::current_exe;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str;
use std::sync::{Arc, Mutex};
use directories_next::ProjectDirs;
use fd_lock::{RwLock, RwLockWriteGuard};
use log::{debug, info};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::config::types::Config;
use crate::error::ConfigError;

const FILE_NAME: &str = "esp32-companion.json";

// esp32-companion.json next to the executable, for installs that travel on a usb stick
fn portable_path() -> Option<PathBuf> {
    let mut path = current_exe()
        .map_err(|err| debug!("Can not determine the executable path: {:?}", err))
        .ok()?;

    // /opt/esp32-companion => /opt/esp32-companion.json
    path.set_extension("json").then_some(path)
}

// the per-user config directory, such as ~/.config/esp32-companion on linux
fn user_path() -> Option<PathBuf> {
    ProjectDirs::from("io", "esp32-companion", "esp32-companion")
        .map(|dirs| dirs.config_dir().join(FILE_NAME))
}

fn default_path() -> Result<PathBuf, ConfigError> {
    match portable_path() {
        Some(path) if path.is_file() => Ok(path),
        _ => user_path().ok_or(ConfigError::NoConfigPath),
    }
}

/// Holds the config file handle the single-instance lock is taken on.
pub struct ConfigIOLocker {
    rw_lock: RwLock<std::fs::File>,
}

impl ConfigIOLocker {
    /// Fails with [`ConfigError::CanNotLock`] while another instance holds the lock.
    pub fn lock(&mut self) -> Result<RwLockWriteGuard<'_, std::fs::File>, ConfigError> {
        self.rw_lock
            .try_write()
            .map_err(|source| ConfigError::CanNotLock { source })
    }
}

struct OpenConfig {
    path: PathBuf,
    file: std::fs::File,
}

/// The JSON config file, opened once and shared.
#[derive(Clone)]
pub struct ConfigIO {
    open: Arc<Mutex<OpenConfig>>,
}

impl ConfigIO {
    /// Opens (creating if needed) the config file at `path`, or at the default location.
    pub fn new_sync(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path,
            None => default_path()?,
        };
        info!("Using config file {}", path.to_string_lossy());

        if let Some(directory) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(directory)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        Ok(ConfigIO { open: Arc::new(Mutex::new(OpenConfig { path, file })) })
    }

    fn open(&self) -> std::sync::MutexGuard<'_, OpenConfig> {
        self.open.lock().expect("Failed to lock config file")
    }

    /// Only one instance of the application may talk to the device; the lock taken through this
    /// locker enforces that.
    pub fn locker(&mut self) -> Result<ConfigIOLocker, ConfigError> {
        let handle = self.open().file.try_clone()?;
        Ok(ConfigIOLocker { rw_lock: RwLock::new(handle) })
    }

    pub fn path(&self) -> PathBuf {
        self.open().path.clone()
    }

    // a clone of the shared handle; closing it leaves the original (and its lock) alone
    fn handle(&self) -> Result<File, ConfigError> {
        let handle = self.open().file.try_clone()?;
        Ok(File::from_std(handle))
    }

    pub async fn read(&self) -> Result<Config, ConfigError> {
        let mut file = self.handle()?;
        debug!("Reading config file");

        let mut bytes = Vec::new();
        file.rewind().await?;
        file.read_to_end(&mut bytes).await?;

        if bytes.is_empty() {
            return Ok(Config::default());
        }

        let config: Config = serde_json::from_str(str::from_utf8(&bytes)?)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let mut file = self.handle()?;
        debug!("Writing config file");

        let json = serde_json::to_string_pretty(config)?;
        file.rewind().await?;
        file.set_len(0).await?;
        file.write_all(json.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ReconnectPolicy;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("esp32-companion-{}-{}.json", name, std::process::id()))
    }

    #[tokio::test]
    async fn missing_file_is_created_and_reads_as_defaults() {
        let path = scratch_path("empty");
        let _ = std::fs::remove_file(&path);

        let config_io = ConfigIO::new_sync(Some(path.clone())).unwrap();
        assert!(path.is_file());
        assert_eq!(config_io.read().await.unwrap(), Config::default());

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn saved_config_is_read_back() {
        let path = scratch_path("saved");
        let _ = std::fs::remove_file(&path);
        let config_io = ConfigIO::new_sync(Some(path.clone())).unwrap();

        let mut config = Config::default();
        config.device_name = "Pump".to_string();
        config.reconnect_policy = ReconnectPolicy::Manual;
        config_io.save(&config).await.unwrap();

        // a shorter document must not leave the tail of the previous one behind
        config.device_name = "P".to_string();
        config_io.save(&config).await.unwrap();

        assert_eq!(config_io.read().await.unwrap(), config);
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn invalid_json_is_reported() {
        let path = scratch_path("invalid");
        std::fs::write(&path, "{ not json").unwrap();

        let config_io = ConfigIO::new_sync(Some(path.clone())).unwrap();
        assert!(matches!(config_io.read().await, Err(ConfigError::JsonError { .. })));
        std::fs::remove_file(&path).unwrap();
    }
}
