use std::fs;
use std::path::Path;

use case_flow::PipelineConfig;
use serde::Deserialize;

const ENV_CONFIG_PATH: &str = "CASE_ANALYSIS_CONFIG";
const DEFAULT_MODEL: &str = "openai/gpt-4.1-mini";
const DEFAULT_PUBMED_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },

    #[error("Failed to read config file {path}: {message}")]
    File { path: String, message: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Where feedback submissions are delivered.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeedbackConfig {
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: String,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            sender: "feedback@case-analysis.local".to_string(),
            recipients: Vec::new(),
            subject: "Case Analysis App Feedback".to_string(),
        }
    }
}

/// YAML configuration file structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConfigFile {
    host: Option<String>,
    port: Option<u16>,
    log_format: Option<LogFormat>,
    openrouter_model: Option<String>,
    pubmed_base_url: Option<String>,
    redactor_url: Option<String>,
    feedback: FeedbackConfig,
    pipeline: PipelineConfig,
}

/// Application configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
    pub openrouter_api_key: String,
    pub openrouter_model: String,
    pub database_url: String,
    pub pubmed_base_url: String,
    pub redactor_url: Option<String>,
    pub sendgrid_api_key: Option<String>,
    pub feedback: FeedbackConfig,
    pub pipeline: PipelineConfig,
}

impl ServiceConfig {
    /// Load configuration from the optional config file and the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolves the config file named by `CASE_ANALYSIS_CONFIG`, then applies
    /// environment overrides read through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = match lookup(ENV_CONFIG_PATH) {
            Some(path) => load_config_file(Path::new(&path))?,
            None => ConfigFile::default(),
        };
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let port = match var("PORT") {
            Some(port) => port.parse().map_err(|_| ConfigError::Invalid {
                key: "PORT",
                message: format!("'{port}' is not a port number"),
            })?,
            None => file.port.unwrap_or(3000),
        };

        let log_format = match var("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            Some("text") => LogFormat::Text,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "LOG_FORMAT",
                    message: format!("expected 'text' or 'json', got '{other}'"),
                });
            }
            None => file.log_format.unwrap_or_default(),
        };

        let config = Self {
            host: var("HOST")
                .or(file.host)
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            log_format,
            openrouter_api_key: var("OPENROUTER_API_KEY")
                .ok_or(ConfigError::Missing("OPENROUTER_API_KEY"))?,
            openrouter_model: var("OPENROUTER_MODEL")
                .or(file.openrouter_model)
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            database_url: var("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
            pubmed_base_url: file
                .pubmed_base_url
                .unwrap_or_else(|| DEFAULT_PUBMED_URL.to_string()),
            redactor_url: var("REDACTOR_URL").or(file.redactor_url),
            sendgrid_api_key: var("SENDGRID_API_KEY"),
            feedback: file.feedback,
            pipeline: file.pipeline,
        };

        config
            .pipeline
            .validate()
            .map_err(|e| ConfigError::Invalid {
                key: "pipeline",
                message: e.to_string(),
            })?;
        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Load configuration from YAML file
fn load_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let file_error = |message: String| ConfigError::File {
        path: path.display().to_string(),
        message,
    };

    let contents = fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
    let contents = contents.trim();
    if contents.is_empty() {
        tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
        return Ok(ConfigFile::default());
    }

    let config = serde_yaml::from_str(contents).map_err(|e| file_error(e.to_string()))?;
    tracing::info!(path = %path.display(), "Loaded configuration from file");
    Ok(config)
}
