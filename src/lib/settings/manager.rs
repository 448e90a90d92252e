use std::{
    io::prelude::*,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::{cli, telemetry::EngineSettings};

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct HeaderSettingsFile {
    pub name: String,
    pub version: u32,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SettingsStruct {
    pub header: HeaderSettingsFile,
    #[serde(default)]
    pub engine: EngineSettings,
}

impl Default for SettingsStruct {
    fn default() -> Self {
        SettingsStruct {
            header: HeaderSettingsFile {
                name: "Media Quality Telemetry".to_string(),
                version: 0,
            },
            engine: EngineSettings::default(),
        }
    }
}

#[derive(Debug)]
struct ManagerStruct {
    pub file_name: String,
    pub config: SettingsStruct,
}

#[derive(Debug, Default)]
struct Manager {
    pub content: Option<ManagerStruct>,
}

lazy_static! {
    static ref MANAGER: Arc<Mutex<Manager>> = Default::default();
}

impl Manager {
    #[instrument(level = "debug")]
    fn new(file_name: &str) -> Result<ManagerStruct> {
        let file_name = resolve_settings_path(file_name)?;

        debug!("Using settings file: {file_name:?}");

        let config = load_settings_from_file(&file_name);

        let settings = ManagerStruct { file_name, config };

        if let Err(error) = save_settings_to_file(&settings.file_name, &settings.config) {
            error!("Failed to save file: {error:#?}");
        }

        Ok(settings)
    }
}

fn resolve_settings_path(file_name: &str) -> Result<String> {
    if Path::new(file_name).is_absolute() {
        return Ok(file_name.to_string());
    }

    let project = ProjectDirs::from("com", "Media Quality", env!("CARGO_PKG_NAME"))
        .ok_or(anyhow!("Failed to find user settings path"))?;

    let folder_path = project.config_dir();
    if let Err(error) = std::fs::create_dir_all(folder_path) {
        error!("Failed to create settings folder: {folder_path:?}, reason: {error:#?}");
    }

    Ok(folder_path.join(file_name).to_string_lossy().to_string())
}

// Init settings manager with the desired settings file,
// will be created if does not exist
pub fn init(file_name: Option<&str>) -> Result<()> {
    let file_name = file_name.unwrap_or("settings.json");
    let content = Manager::new(file_name)?;

    let mut manager = MANAGER
        .lock()
        .map_err(|error| anyhow!("Settings manager lock is poisoned: {error:?}"))?;
    manager.content = Some(content);

    Ok(())
}

fn load_settings_from_file(file_name: &str) -> SettingsStruct {
    let content = match std::fs::read_to_string(file_name) {
        Ok(content) => content,
        Err(error) => {
            debug!("Settings file {file_name:?} not loaded ({error}), using defaults");
            return SettingsStruct::default();
        }
    };

    serde_json::from_str(&content).unwrap_or_else(|error| {
        warn!("Settings file {file_name:?} is invalid ({error}), using defaults");
        SettingsStruct::default()
    })
}

fn save_settings_to_file(file_name: &str, content: &SettingsStruct) -> Result<()> {
    let value = serde_json::to_string_pretty(content)?;
    let mut file = std::fs::File::create(file_name)
        .with_context(|| format!("Failed to create settings file {file_name:?}"))?;
    file.write_all(value.as_bytes())?;
    Ok(())
}

// Save the latest state of the settings
pub fn save() {
    let Ok(manager) = MANAGER.lock() else {
        error!("Settings manager lock is poisoned");
        return;
    };

    if let Some(content) = &manager.content {
        if let Err(error) = save_settings_to_file(&content.file_name, &content.config) {
            error!(
                "Failed to save settings: file: {:#?}, configuration: {:#?}, error: {:#?}",
                &content.file_name, &content.config, error
            );
        }
    }
}

pub fn file_name() -> Option<String> {
    let manager = MANAGER.lock().ok()?;
    manager
        .content
        .as_ref()
        .map(|content| content.file_name.clone())
}

/// Engine settings from the file, without command line overrides.
pub fn engine_settings() -> EngineSettings {
    MANAGER
        .lock()
        .ok()
        .and_then(|manager| {
            manager
                .content
                .as_ref()
                .map(|content| content.config.engine.clone())
        })
        .unwrap_or_default()
}

pub fn set_engine_settings(engine: &EngineSettings) {
    // Take care of scope mutex
    {
        let Ok(mut manager) = MANAGER.lock() else {
            error!("Settings manager lock is poisoned");
            return;
        };
        if let Some(content) = manager.content.as_mut() {
            content.config.engine = engine.clone();
        }
    }
    save();
}

/// Engine settings with the command line overrides applied on top.
pub fn effective_engine_settings() -> EngineSettings {
    let mut engine = engine_settings();

    if let Some(poll_interval_ms) = cli::manager::poll_interval_ms() {
        engine.poll_interval_ms = poll_interval_ms;
    }
    if let Some(min_poll_spacing_ms) = cli::manager::min_poll_spacing_ms() {
        engine.min_poll_spacing_ms = min_poll_spacing_ms;
    }
    if cli::manager::is_cpu_sampler_disabled() {
        engine.cpu_sampler = false;
    }

    engine
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    fn generate_random_settings_file_name() -> String {
        use rand::Rng;

        let rand_string: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(30)
            .map(char::from)
            .collect();

        std::env::temp_dir()
            .join(format!("{rand_string}.json"))
            .to_string_lossy()
            .to_string()
    }

    #[test]
    #[serial]
    fn missing_file_is_created_with_defaults() {
        let path = generate_random_settings_file_name();
        init(Some(&path)).unwrap();

        assert!(Path::new(&path).exists(), "Settings file does not exist");
        assert_eq!(engine_settings(), EngineSettings::default());
        assert_eq!(file_name(), Some(path.clone()));
    }

    #[test]
    #[serial]
    fn saved_settings_are_loaded_back() {
        let path = generate_random_settings_file_name();
        init(Some(&path)).unwrap();

        let engine = EngineSettings {
            poll_interval_ms: 1000,
            cpu_pressure_threshold_pct: 65.0,
            ..Default::default()
        };
        set_engine_settings(&engine);

        init(Some(&path)).unwrap();
        assert_eq!(engine_settings(), engine);
    }

    #[test]
    #[serial]
    fn invalid_file_falls_back_to_defaults() {
        let path = generate_random_settings_file_name();
        std::fs::write(&path, "{ not json").unwrap();

        init(Some(&path)).unwrap();
        assert_eq!(engine_settings(), EngineSettings::default());
    }
}
