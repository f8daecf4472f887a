mod config_loader;
mod context_config;
mod model_registry;


pub use config_loader::{
    AppConfig, ConfigLoader, LoggingConfig, ModelsConfig, RuntimeConfig, ServerConfig,
};
pub use context_config::ContextSettings;
pub use model_registry::{ActiveProfile, FlagValue, ModelProfile, ModelRegistry, ModelRegistryData};
