use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use super::persona::{Persona, PersonaConfig, PersonaResult};

pub const SETTINGS_DIRECTORY_NAME: &str = "vellum";
pub const PERSONAS_FILE_NAME: &str = "personas.json";

/// On-disk persona settings: the configured records plus the current
/// selection. Validation happens when a record is turned into a [`Persona`],
/// not at load time, so a broken entry never blocks the rest of the file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PersonaSettings {
    #[serde(default)]
    pub personas: Vec<PersonaConfig>,
    #[serde(default)]
    pub selected: Option<String>,
}

impl PersonaSettings {
    pub fn config(&self, id: &str) -> Option<&PersonaConfig> {
        self.personas.iter().find(|config| config.id == id)
    }

    pub fn selected_config(&self) -> Option<&PersonaConfig> {
        self.selected.as_deref().and_then(|id| self.config(id))
    }

    pub fn normalized(mut self) -> Self {
        for config in &mut self.personas {
            config.id = config.id.trim().to_string();
        }
        // Drop rows that lost their identity entirely.
        self.personas.retain(|config| !config.id.is_empty());

        // Clear a selection that no longer points at a configured persona.
        let dangling = self
            .selected
            .as_deref()
            .is_some_and(|selected| !self.personas.iter().any(|config| config.id == selected));
        if dangling {
            self.selected = None;
        }

        self
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PersonaStoreError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize persona settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write persona settings at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace persona settings from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("persona '{id}' is not configured"))]
    UnknownPersona { id: String },
}

pub type PersonaStoreResult<T> = Result<T, PersonaStoreError>;

/// Durable persona settings with lock-free snapshot reads.
pub struct PersonaStore {
    settings: Arc<ArcSwap<PersonaSettings>>,
    config_path: PathBuf,
}

impl PersonaStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".vellum"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(PERSONAS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn settings(&self) -> Arc<PersonaSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: PersonaSettings) -> PersonaStoreResult<()> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Adds or replaces one persona record, keyed by id.
    pub fn upsert_persona(&self, config: PersonaConfig) -> PersonaStoreResult<()> {
        let mut settings = (*self.settings()).clone();
        match settings
            .personas
            .iter_mut()
            .find(|existing| existing.id == config.id)
        {
            Some(existing) => *existing = config,
            None => settings.personas.push(config),
        }
        self.update(settings)
    }

    pub fn remove_persona(&self, id: &str) -> PersonaStoreResult<()> {
        let mut settings = (*self.settings()).clone();
        settings.personas.retain(|config| config.id != id);
        self.update(settings)
    }

    pub fn select(&self, id: &str) -> PersonaStoreResult<()> {
        let mut settings = (*self.settings()).clone();
        if settings.config(id).is_none() {
            return UnknownPersonaSnafu { id: id.to_string() }.fail();
        }
        settings.selected = Some(id.to_string());
        self.update(settings)
    }

    /// Validates the currently selected record into a runtime persona.
    /// `None` when nothing is selected; a validation failure passes through
    /// so the shell can surface which field is broken.
    pub fn selected_persona(&self) -> Option<PersonaResult<Persona>> {
        let settings = self.settings();
        settings.selected_config().map(Persona::new)
    }

    fn load_from_disk(path: &PathBuf) -> PersonaSettings {
        if !path.exists() {
            tracing::info!("persona settings not found at {:?}, using defaults", path);
            return PersonaSettings::default();
        }

        let figment =
            Figment::from(Serialized::defaults(PersonaSettings::default())).merge(Json::file(path));

        match figment.extract::<PersonaSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse persona settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                PersonaSettings::default()
            }
        }
    }

    fn persist(&self, settings: &PersonaSettings) -> PersonaStoreResult<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-personas-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-personas-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-personas-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved persona settings to {:?}", self.config_path);
        Ok(())
    }
}
