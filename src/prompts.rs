use std::{
    env, fs,
    path::{Path, PathBuf},
};

use handlebars::Handlebars;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::functions::ToolRegistry;

pub const PROMPT_DIR_ENV: &str = "CALCBOT_PROMPT_DIR";
pub const DEFAULT_PROMPT_DIR: &str = "prompts";

#[derive(Debug, Error)]
pub enum PromptLoadError {
    #[error("prompt file not found: {0}")]
    NotFound(PathBuf),
    #[error("prompt file read error: {0}")]
    Io(#[from] std::io::Error),
    #[error("prompt is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("prompt is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unsupported prompt format (expected .json, .yaml or .yml): {0}")]
    UnsupportedFormat(PathBuf),
    #[error("prompt has no 'description' field: {0}")]
    MissingDescription(PathBuf),
    #[error("prompt template error: {0}")]
    Template(#[from] handlebars::RenderError),
}

// Every other key in the file is ignored.
#[derive(Debug, Deserialize)]
struct PromptFile {
    #[serde(default)]
    description: Option<String>,
}

/// A system instruction loaded from disk. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    name: String,
    description: String,
}

impl Prompt {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Renders the description as a Handlebars template. `{{tools}}` expands
    /// to one `- name: description` line per registered tool.
    pub fn render(&self, registry: &ToolRegistry) -> Result<String, PromptLoadError> {
        if !self.description.contains("{{") {
            return Ok(self.description.clone());
        }

        let tools = registry
            .definitions()
            .into_iter()
            .map(|definition| match definition.description {
                Some(description) => format!("- {}: {}", definition.name, description),
                None => format!("- {}", definition.name),
            })
            .collect::<Vec<_>>()
            .join("\n");

        let mut hb = Handlebars::new();
        hb.register_escape_fn(handlebars::no_escape);
        Ok(hb.render_template(&self.description, &json!({ "tools": tools }))?)
    }
}

pub fn load_prompt(path: impl AsRef<Path>) -> Result<Prompt, PromptLoadError> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(PromptLoadError::NotFound(path.to_path_buf()));
    }

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    let raw = fs::read_to_string(path)?;
    let parsed: PromptFile = match extension.as_deref() {
        Some("json") => serde_json::from_str(&raw)?,
        Some("yaml") | Some("yml") => serde_yaml::from_str(&raw)?,
        _ => return Err(PromptLoadError::UnsupportedFormat(path.to_path_buf())),
    };

    let description = parsed
        .description
        .ok_or_else(|| PromptLoadError::MissingDescription(path.to_path_buf()))?;

    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    tracing::debug!(prompt = %path.display(), "loaded prompt");
    Ok(Prompt::new(name, description))
}

/// A directory of prompt files addressed by file name.
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    dir: PathBuf,
}

impl PromptLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn from_env() -> Self {
        let dir = env::var(PROMPT_DIR_ENV).unwrap_or_else(|_| DEFAULT_PROMPT_DIR.to_string());
        Self::new(dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load(&self, name: &str) -> Result<Prompt, PromptLoadError> {
        load_prompt(self.dir.join(name))
    }
}

impl Default for PromptLibrary {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_DIR)
    }
}
