//! Configuration module for Sidechat.
//!
//! Manages sidebar settings stored in the key-value store.

mod settings;

pub use settings::{
    Settings, API_KEY_KEY, AVAILABLE_MODELS, DEFAULT_MODEL, MODEL_KEY, VISION_MODEL,
};
