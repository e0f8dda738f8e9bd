//! Sidebar settings.
//!
//! Settings are persisted as two flat keys, `apiKey` and `model`, in the
//! key-value store. Missing or malformed values fall back to defaults.

use serde::{Deserialize, Serialize};

use crate::db::{Database, StoreError};

/// Storage key for the API credential.
pub const API_KEY_KEY: &str = "apiKey";

/// Storage key for the selected model.
pub const MODEL_KEY: &str = "model";

/// Default model. Vision-capable, so it also serves image turns.
pub const DEFAULT_MODEL: &str = "pixtral-large-latest";

/// Model used whenever the newest turn carries images.
pub const VISION_MODEL: &str = "pixtral-large-latest";

/// Models offered in the settings picker.
pub const AVAILABLE_MODELS: &[&str] = &[
    "pixtral-large-latest",
    "mistral-large-latest",
    "mistral-medium-latest",
    "mistral-small-latest",
    "open-mistral-nemo",
];

/// Sidebar settings.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Bearer token for the chat-completions API. Empty when not configured.
    pub api_key: String,

    /// Selected model identifier.
    pub model: String,
}

// Hand-written so the credential never ends up in logs.
impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("model", &self.model)
            .finish()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

impl Settings {
    /// Load settings from the store, using defaults for missing values.
    pub fn load(db: &Database) -> Self {
        let mut settings = Self::default();

        match db.get::<String>(API_KEY_KEY) {
            Ok(Some(key)) => settings.api_key = key,
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to load API key, leaving it unset"),
        }

        match db.get::<String>(MODEL_KEY) {
            Ok(Some(model)) if !model.trim().is_empty() => settings.model = model,
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to load model, using default"),
        }

        settings
    }

    /// Save both values to the store.
    pub fn save(&self, db: &Database) -> Result<(), StoreError> {
        db.set(API_KEY_KEY, &self.api_key)?;
        db.set(MODEL_KEY, &self.model)?;
        Ok(())
    }

    /// Normalize user input: trim the key, fall back to the default model.
    pub fn validate(&mut self) {
        self.api_key = self.api_key.trim().to_string();
        self.model = self.model.trim().to_string();
        if self.model.is_empty() {
            self.model = DEFAULT_MODEL.to_string();
        }
    }

    /// Whether a credential has been configured.
    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    /// Model to request, given whether the newest turn carries images.
    pub fn model_for(&self, has_images: bool) -> &str {
        if has_images {
            VISION_MODEL
        } else {
            &self.model
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
