use std::env;
use std::str::FromStr;

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct Config {
    // Server configuration
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub max_upload_bytes: usize,

    pub llm: LlmConfig,

    // Calendar output; weekly rules end with the current year unless pinned
    pub recurrence_until_year: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub vision_model: String,
    pub reasoning_effort: String,
    pub max_completion_tokens: u32,
    pub vision_max_tokens: u32,
    pub timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("OPENAI_API_KEY")
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::Missing("OPENAI_API_KEY"))?;

        let cors_origins = lookup("CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000".to_string())
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Config {
            host: lookup("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_var(&lookup, "PORT", 8000)?,
            cors_origins,
            max_upload_bytes: parse_var(&lookup, "MAX_UPLOAD_BYTES", 20 * 1024 * 1024)?,

            llm: LlmConfig {
                api_key,
                base_url: lookup("OPENAI_BASE_URL")
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                model: lookup("OPENAI_MODEL").unwrap_or_else(|| "o4-mini-2025-04-16".to_string()),
                vision_model: lookup("OPENAI_VISION_MODEL").unwrap_or_else(|| "gpt-4o".to_string()),
                reasoning_effort: lookup("OPENAI_REASONING_EFFORT")
                    .unwrap_or_else(|| "low".to_string()),
                max_completion_tokens: parse_var(&lookup, "MAX_COMPLETION_TOKENS", 12000)?,
                vision_max_tokens: parse_var(&lookup, "VISION_MAX_TOKENS", 4000)?,
                timeout_secs: parse_var(&lookup, "LLM_TIMEOUT_SECS", 300)?,
            },

            recurrence_until_year: parse_opt_var(&lookup, "ICS_RECURRENCE_UNTIL_YEAR")?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    Ok(parse_opt_var(lookup, name)?.unwrap_or(default))
}

fn parse_opt_var<F, T>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(name)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { name, value })
        })
        .transpose()
}
