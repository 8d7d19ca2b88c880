//! Generative answer backends.
//!
//! The synthesizer only sees [`TextGenerator`]; which backend sits behind it is
//! decided once, when the pipeline is built.

pub mod ollama;
pub mod openai;

use crate::error::GenerationError;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub use ollama::OllamaGenerator;
pub use openai::OpenAiGenerator;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_MODEL: &str = "mistral";
pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";

/// Instruction sent as the system message (or prefixed to the prompt) for every backend.
pub const SYSTEM_INSTRUCTION: &str =
    "You are an assistant that answers precisely from the provided context.";

#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Extractive,
    Ollama,
    OpenAi,
}

impl FromStr for BackendKind {
    type Err = GenerationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "extractive" | "offline" | "" => Ok(BackendKind::Extractive),
            "ollama" => Ok(BackendKind::Ollama),
            "openai" => Ok(BackendKind::OpenAi),
            other => Err(GenerationError::Configuration(format!(
                "unknown backend '{other}', expected extractive, ollama or openai"
            ))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Extractive => "extractive",
            BackendKind::Ollama => "ollama",
            BackendKind::OpenAi => "openai",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub ollama_url: String,
    pub ollama_model: String,
    pub openai_url: String,
    pub openai_model: String,
    pub openai_api_key: Option<String>,
    pub temperature: f32,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            ollama_model: DEFAULT_OLLAMA_MODEL.to_string(),
            openai_url: DEFAULT_OPENAI_URL.to_string(),
            openai_model: DEFAULT_OPENAI_MODEL.to_string(),
            openai_api_key: None,
            temperature: 0.3,
        }
    }
}

/// Builds the generator for `kind`. `Extractive` needs none and yields `None`.
pub fn create_generator(
    kind: BackendKind,
    settings: &GeneratorSettings,
) -> Result<Option<Arc<dyn TextGenerator>>, GenerationError> {
    match kind {
        BackendKind::Extractive => Ok(None),
        BackendKind::Ollama => {
            let generator = OllamaGenerator::new(&settings.ollama_url, &settings.ollama_model)?;
            Ok(Some(Arc::new(generator)))
        }
        BackendKind::OpenAi => {
            let api_key = settings
                .openai_api_key
                .as_deref()
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .ok_or_else(|| {
                    GenerationError::Configuration("openai backend requires an API key".to_string())
                })?;
            let generator =
                OpenAiGenerator::new(&settings.openai_url, &settings.openai_model, api_key)?
                    .with_temperature(settings.temperature);
            Ok(Some(Arc::new(generator)))
        }
    }
}
