use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use llamarelay_common::{Error, Result};
use tracing::warn;

// Launch keys backed by typed fields of `ModelProfile`
const KEY_GPU_LAYERS: &str = "n-gpu-layers";
const KEY_NOBROWSER: &str = "nobrowser";
const KEY_PORT: &str = "port";
const KEY_TIMEOUT: &str = "timeout";
const KEY_CTX_SIZE: &str = "ctx-size";

/// Value of a single launch flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FlagValue {
    /// Parse `raw` into the same kind of value as `self`
    pub fn parse_like(&self, raw: &str) -> std::result::Result<FlagValue, String> {
        let raw = raw.trim();
        match self {
            FlagValue::Bool(_) => match raw.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(FlagValue::Bool(true)),
                "false" | "0" | "no" | "off" => Ok(FlagValue::Bool(false)),
                _ => Err(format!("expected a boolean, got '{}'", raw)),
            },
            FlagValue::Int(_) => raw
                .parse::<i64>()
                .map(FlagValue::Int)
                .map_err(|_| format!("expected an integer, got '{}'", raw)),
            FlagValue::Float(_) => raw
                .parse::<f64>()
                .map(FlagValue::Float)
                .map_err(|_| format!("expected a number, got '{}'", raw)),
            FlagValue::Text(_) => Ok(FlagValue::Text(raw.to_string())),
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            FlagValue::Int(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for FlagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagValue::Bool(value) => write!(f, "{}", value),
            FlagValue::Int(value) => write!(f, "{}", value),
            FlagValue::Float(value) => write!(f, "{}", value),
            FlagValue::Text(value) => f.write_str(value),
        }
    }
}

/// Launch parameters for one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Unique model name
    pub name: String,
    /// Model binary (a llamafile or a llama.cpp server)
    pub executable: PathBuf,
    /// Interpreter the executable is run through, if any
    #[serde(default)]
    pub launcher: Option<PathBuf>,
    pub port: u16,
    pub ctx_size: usize,
    /// GPU layers (999 for all, 0 for CPU only)
    pub n_gpu_layers: i32,
    /// Server timeout in seconds, also the completion deadline
    pub timeout: u64,
    #[serde(default)]
    pub nobrowser: bool,
    /// Additional `--key value` flags passed through verbatim
    #[serde(default)]
    pub extra_flags: BTreeMap<String, FlagValue>,
    /// Whether this is the default model
    #[serde(default)]
    pub default: bool,
}

impl ModelProfile {
    /// All launch settings in command-line order
    pub fn launch_settings(&self) -> Vec<(String, FlagValue)> {
        let mut settings = vec![
            (KEY_GPU_LAYERS.to_string(), FlagValue::Int(self.n_gpu_layers as i64)),
            (KEY_NOBROWSER.to_string(), FlagValue::Bool(self.nobrowser)),
            (KEY_PORT.to_string(), FlagValue::Int(self.port as i64)),
            (KEY_TIMEOUT.to_string(), FlagValue::Int(self.timeout as i64)),
            (KEY_CTX_SIZE.to_string(), FlagValue::Int(self.ctx_size as i64)),
        ];
        settings.extend(
            self.extra_flags
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        settings
    }

    /// Flags for the command line. `true` booleans become bare switches,
    /// `false` ones are left out, everything else is `--key value`.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (key, value) in self.launch_settings() {
            match value {
                FlagValue::Bool(true) => args.push(format!("--{}", key)),
                FlagValue::Bool(false) => {}
                other => {
                    args.push(format!("--{}", key));
                    args.push(other.to_string());
                }
            }
        }
        args
    }

    /// Current value of a launch setting by its flag name
    pub fn get_setting(&self, key: &str) -> Option<FlagValue> {
        self.launch_settings()
            .into_iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    /// Set a launch setting, checking both the key and the value range
    pub fn set_setting(&mut self, key: &str, value: FlagValue) -> Result<()> {
        let invalid = |reason: String| Error::InvalidSetting {
            key: key.to_string(),
            reason,
        };
        let int = |value: &FlagValue| {
            value
                .as_int()
                .ok_or_else(|| invalid(format!("expected an integer, got '{}'", value)))
        };

        match key {
            KEY_GPU_LAYERS => {
                self.n_gpu_layers = i32::try_from(int(&value)?)
                    .map_err(|_| invalid("out of range".into()))?;
            }
            KEY_PORT => {
                self.port = u16::try_from(int(&value)?)
                    .map_err(|_| invalid("port must be between 0 and 65535".into()))?;
            }
            KEY_TIMEOUT => {
                self.timeout = u64::try_from(int(&value)?)
                    .map_err(|_| invalid("timeout cannot be negative".into()))?;
            }
            KEY_CTX_SIZE => {
                self.ctx_size = usize::try_from(int(&value)?)
                    .map_err(|_| invalid("context size cannot be negative".into()))?;
            }
            KEY_NOBROWSER => match value {
                FlagValue::Bool(flag) => self.nobrowser = flag,
                other => return Err(invalid(format!("expected a boolean, got '{}'", other))),
            },
            _ => match self.extra_flags.get_mut(key) {
                Some(slot) => *slot = value,
                None => return Err(Error::UnknownSetting(key.to_string())),
            },
        }
        Ok(())
    }

    /// Deadline for a single completion against this model
    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Resolve a relative executable against a model directory
    pub fn resolve_executable(&mut self, model_dir: &Path) {
        if self.executable.is_relative() {
            self.executable = model_dir.join(&self.executable);
        }
    }

    /// The executable must be an installed file before anything is spawned
    pub fn validate_executable(&self) -> Result<()> {
        if self.executable.is_file() {
            Ok(())
        } else {
            Err(Error::SpawnFailure(format!(
                "model executable not found: {}",
                self.executable.display()
            )))
        }
    }
}

/// The selected profile plus the overrides applied on top of it.
///
/// Switching models replaces the base profile wholesale and drops every
/// override; overrides are validated against the profile when set.
#[derive(Debug, Clone)]
pub struct ActiveProfile {
    base: ModelProfile,
    overrides: BTreeMap<String, FlagValue>,
}

impl ActiveProfile {
    pub fn new(base: ModelProfile) -> Self {
        Self {
            base,
            overrides: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.base.name
    }

    /// Switch to another registered model
    pub fn select(&mut self, registry: &ModelRegistry, name: &str) -> Result<()> {
        let profile = registry.profile(name)?;
        self.base = profile;
        self.overrides.clear();
        Ok(())
    }

    /// Override one launch setting. The raw value is parsed into the type
    /// of the model's default for that key.
    pub fn update_setting(&mut self, key: &str, raw: &str) -> Result<FlagValue> {
        let default = self
            .base
            .get_setting(key)
            .ok_or_else(|| Error::UnknownSetting(key.to_string()))?;
        let value = default.parse_like(raw).map_err(|reason| Error::InvalidSetting {
            key: key.to_string(),
            reason,
        })?;

        let mut candidate = self.effective();
        candidate.set_setting(key, value.clone())?;

        self.overrides.insert(key.to_string(), value.clone());
        Ok(value)
    }

    /// Drop every override
    pub fn reset(&mut self) {
        self.overrides.clear();
    }

    pub fn overrides(&self) -> &BTreeMap<String, FlagValue> {
        &self.overrides
    }

    /// Base profile with all overrides applied
    pub fn effective(&self) -> ModelProfile {
        let mut profile = self.base.clone();
        for (key, value) in &self.overrides {
            if let Err(e) = profile.set_setting(key, value.clone()) {
                warn!("Skipping override {}: {}", key, e);
            }
        }
        profile
    }

    /// Render the current settings as `key: value` pairs
    pub fn format_settings(&self, separator: &str) -> String {
        let profile = self.effective();
        let mut lines = vec![
            format!("model_name: {}", profile.name),
            format!("model_executable: {}", profile.executable.display()),
        ];
        lines.extend(
            profile
                .launch_settings()
                .into_iter()
                .map(|(key, value)| format!("{}: {}", key, value)),
        );
        lines.join(separator)
    }
}

/// Registry containing the known model profiles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRegistryData {
    pub version: String,
    pub models: Vec<ModelProfile>,
}

/// Model registry manager
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, ModelProfile>,
    model_dir: Option<PathBuf>,
    default_model_id: Option<String>,
}

impl ModelRegistry {
    /// Load registry from JSON file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_json(&content)
    }

    /// Load registry from JSON string
    pub fn load_from_json(json: &str) -> Result<Self> {
        let data: ModelRegistryData = serde_json::from_str(json)?;
        Self::from_data(data)
    }

    /// Create registry from data
    fn from_data(data: ModelRegistryData) -> Result<Self> {
        let mut registry = Self::default();

        for model in data.models {
            if model.default {
                if registry.default_model_id.is_some() {
                    return Err(Error::ConfigError("Multiple default models specified".into()));
                }
                registry.default_model_id = Some(model.name.clone());
            }
            if registry.models.contains_key(&model.name) {
                return Err(Error::ConfigError(format!(
                    "Duplicate model name: {}",
                    model.name
                )));
            }
            registry.models.insert(model.name.clone(), model);
        }

        if registry.default_model_id.is_none() {
            // If no default specified, use the first name in sorted order
            registry.default_model_id = registry.list_models().into_iter().next();
        }

        Ok(registry)
    }

    /// Load default registry with the built-in models
    pub fn load_defaults() -> Result<Self> {
        let json = include_str!("default_registry.json");
        Self::load_from_json(json)
    }

    /// Get a model by name
    pub fn get_model(&self, name: &str) -> Result<&ModelProfile> {
        self.models.get(name).ok_or_else(|| {
            Error::ModelNotFound(format!(
                "'{}' is not recognized. Available models are: {}",
                name,
                self.list_models().join(", ")
            ))
        })
    }

    /// Owned profile with its executable resolved against the model directory
    pub fn profile(&self, name: &str) -> Result<ModelProfile> {
        let mut profile = self.get_model(name)?.clone();
        if let Some(dir) = &self.model_dir {
            profile.resolve_executable(dir);
        }
        Ok(profile)
    }

    /// Get the default model
    pub fn get_default_model(&self) -> Result<&ModelProfile> {
        let name = self
            .default_model_id
            .as_ref()
            .ok_or_else(|| Error::ConfigError("No default model configured".into()))?;
        self.get_model(name)
    }

    /// Set the directory relative executables live in
    pub fn set_model_dir(&mut self, dir: PathBuf) {
        self.model_dir = Some(dir);
    }

    /// List all model names, sorted
    pub fn list_models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.keys().cloned().collect();
        names.sort();
        names
    }
}
