use std::{
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const MAX_SETTINGS_BYTES: u64 = 64 * 1024;
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8080";

const SAVE_ATTEMPTS: u32 = 3;
const SAVE_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ClientSettings {
    #[serde(default)]
    pub server_url: Option<String>,
    /// `None` means the working directory.
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
}

impl ClientSettings {
    pub fn resolve_server_url(&self, flag: Option<&str>) -> String {
        flag.or(self.server_url.as_deref())
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .unwrap_or(DEFAULT_SERVER_URL)
            .to_owned()
    }

    pub fn resolve_download_dir(&self, flag: Option<&Path>) -> PathBuf {
        flag.or(self.download_dir.as_deref())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("{} exceeds {max} bytes", .path.display())]
    TooLarge { path: PathBuf, max: u64 },
    #[error("cannot read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("cannot write {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("{} is not valid settings json: {source}", .path.display())]
    Format {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/deaddrop/settings.json`, where the config dir comes from
    /// `XDG_CONFIG_HOME`, `APPDATA` or `LOCALAPPDATA`, else the working directory.
    pub fn default_location() -> Self {
        let base = ["XDG_CONFIG_HOME", "APPDATA", "LOCALAPPDATA"]
            .into_iter()
            .find_map(std::env::var_os)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join("deaddrop").join("settings.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<ClientSettings, SettingsError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(ClientSettings::default());
            }
            Err(source) => return Err(self.read_error(source)),
        };

        let mut raw = Vec::new();
        file.take(MAX_SETTINGS_BYTES + 1)
            .read_to_end(&mut raw)
            .map_err(|source| self.read_error(source))?;
        if raw.len() as u64 > MAX_SETTINGS_BYTES {
            return Err(SettingsError::TooLarge {
                path: self.path.clone(),
                max: MAX_SETTINGS_BYTES,
            });
        }

        serde_json::from_slice(&raw).map_err(|source| SettingsError::Format {
            path: self.path.clone(),
            source,
        })
    }

    pub fn load_or_default(&self) -> ClientSettings {
        self.load().unwrap_or_else(|err| {
            debug!("using default settings: {}", err);
            ClientSettings::default()
        })
    }

    /// Writes a sibling `.tmp` file and renames it over the old settings.
    pub fn save(&self, settings: &ClientSettings) -> Result<(), SettingsError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|source| self.write_error(source))?;
        }

        let payload =
            serde_json::to_vec_pretty(settings).map_err(|source| SettingsError::Format {
                path: self.path.clone(),
                source,
            })?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, payload)
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(|source| {
                let _ = fs::remove_file(&tmp);
                self.write_error(source)
            })
    }

    pub fn save_with_retry(&self, settings: &ClientSettings) -> Result<(), SettingsError> {
        let mut backoff = SAVE_BACKOFF;
        for attempt in 1..SAVE_ATTEMPTS {
            match self.save(settings) {
                Ok(()) => return Ok(()),
                Err(err) => debug!(attempt, "settings save failed, retrying: {}", err),
            }
            std::thread::sleep(backoff);
            backoff *= 2;
        }
        self.save(settings)
    }

    fn read_error(&self, source: io::Error) -> SettingsError {
        SettingsError::Read {
            path: self.path.clone(),
            source,
        }
    }

    fn write_error(&self, source: io::Error) -> SettingsError {
        SettingsError::Write {
            path: self.path.clone(),
            source,
        }
    }
}
