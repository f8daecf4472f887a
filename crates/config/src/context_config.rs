use llamarelay_common::{Error, Result};
use serde::{Deserialize, Serialize};

const MAIN_CONTEXT: &str = "main_context";
const MULTIMODAL_CONTEXT: &str = "multimodal_context";

/// System context strings prepended to prompts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    /// Used for plain prompts and dialogue turns
    pub main_context: String,
    /// Used for prompts carrying an image
    pub multimodal_context: String,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            main_context: "You are Llama, a helpful assistant in a group chat. \
                           Answer clearly and keep replies short."
                .to_string(),
            multimodal_context: "You are an assistant that can see images. \
                                 Describe the attached image and answer questions about it."
                .to_string(),
        }
    }
}

impl ContextSettings {
    pub fn list_settings() -> &'static [&'static str] {
        &[MAIN_CONTEXT, MULTIMODAL_CONTEXT]
    }

    pub fn get_setting(&self, key: &str) -> Option<&str> {
        match key {
            MAIN_CONTEXT => Some(&self.main_context),
            MULTIMODAL_CONTEXT => Some(&self.multimodal_context),
            _ => None,
        }
    }

    pub fn update_setting(&mut self, key: &str, value: &str) -> Result<()> {
        let slot = match key {
            MAIN_CONTEXT => &mut self.main_context,
            MULTIMODAL_CONTEXT => &mut self.multimodal_context,
            _ => return Err(Error::UnknownSetting(key.to_string())),
        };
        *slot = value.to_string();
        Ok(())
    }

    pub fn format_settings(&self, separator: &str) -> String {
        Self::list_settings()
            .iter()
            .filter_map(|key| self.get_setting(key).map(|value| format!("{}: {}", key, value)))
            .collect::<Vec<_>>()
            .join(separator)
    }
}
