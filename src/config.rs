use crate::window::{DEFAULT_CONTEXT_LENGTH_MAX, PREAMBLE};
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const CONFIG_PATH_ENV: &str = "CHATRELAY_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.toml";

const DEFAULT_API_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_DATA_DIR: &str = "/data";
const DEFAULT_DATABASE_FILENAME: &str = "db.sqlite";
const DEFAULT_MAX_MESSAGES_IN_HISTORY: u64 = 101;
const DEFAULT_MAX_TOKENS_TO_GENERATE: u64 = 301;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    discord: DiscordConfig,
    api: ApiConfig,
    storage: StorageConfig,
    conversation: ConversationConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct DiscordConfig {
    token: Option<String>,
    owner_id: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ApiConfig {
    key: Option<String>,
    url: Option<String>,
    model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct StorageConfig {
    data_dir: Option<String>,
    database_filename: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ConversationConfig {
    max_messages_in_history: Option<u64>,
    max_tokens_to_generate: Option<u64>,
    context_length_max: Option<u64>,
    debug_log_prompts: Option<bool>,
}

/// Process-wide settings, resolved once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct Config {
    pub discord_token: String,
    pub owner_id: u64,
    pub api_key: String,
    pub api_url: String,
    pub model: String,
    pub data_dir: PathBuf,
    pub database_filename: String,
    pub max_messages_in_history: u64,
    pub max_tokens_to_generate: u64,
    pub context_length_max: u64,
    pub debug_log_prompts: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).ok();
        let file = match path.as_deref() {
            Some(path) => Some(read_file(Path::new(path))?),
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Some(read_file(Path::new(DEFAULT_CONFIG_PATH))?)
            }
            None => None,
        };

        Self::from_sources(file.as_deref(), |key| std::env::var(key).ok())
    }

    /// Resolves defaults, then the TOML document, then the environment.
    pub fn from_sources(
        file: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let file: ConfigFile = match file {
            Some(content) => toml::from_str(content).context("Failed to parse config file")?,
            None => ConfigFile::default(),
        };

        let discord_token = env("DISCORD_TOKEN")
            .or(file.discord.token)
            .context("DISCORD_TOKEN is not set")?;

        let owner_id = match env("DISCORD_OWNER_ID") {
            Some(raw) => parse_number(&raw, "DISCORD_OWNER_ID")?,
            None => file
                .discord
                .owner_id
                .context("DISCORD_OWNER_ID is not set")?,
        };

        let api_key = env("OPENAI_API_KEY")
            .or(file.api.key)
            .context("OPENAI_API_KEY is not set")?;

        let api_url = env("OPENAI_API_URL")
            .or(file.api.url)
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let model = env("OPENAI_MODEL")
            .or(file.api.model)
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let data_dir = env("APPLICATION_DATA_ROOT_DIR_PATH")
            .or(file.storage.data_dir)
            .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());
        let database_filename = env("DATABASE_FILENAME")
            .or(file.storage.database_filename)
            .unwrap_or_else(|| DEFAULT_DATABASE_FILENAME.to_string());

        let max_messages_in_history = number_setting(
            &env,
            "MAX_MESSAGES_IN_HISTORY",
            file.conversation.max_messages_in_history,
            DEFAULT_MAX_MESSAGES_IN_HISTORY,
        )?;
        let max_tokens_to_generate = number_setting(
            &env,
            "MAX_TOKENS_TO_GENERATE",
            file.conversation.max_tokens_to_generate,
            DEFAULT_MAX_TOKENS_TO_GENERATE,
        )?;
        let context_length_max = number_setting(
            &env,
            "CONTEXT_LENGTH_MAX",
            file.conversation.context_length_max,
            DEFAULT_CONTEXT_LENGTH_MAX,
        )?;

        let debug_log_prompts = match env("DEBUG_LOG_PROMPTS") {
            Some(raw) => raw == "true",
            None => file.conversation.debug_log_prompts.unwrap_or(false),
        };

        let config = Self {
            discord_token,
            owner_id,
            api_key,
            api_url,
            model,
            data_dir: data_dir.into(),
            database_filename,
            max_messages_in_history,
            max_tokens_to_generate,
            context_length_max,
            debug_log_prompts,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let reserved = PREAMBLE.chars().count() as u64 + self.max_tokens_to_generate;
        if reserved >= self.context_length_max {
            bail!(
                "MAX_TOKENS_TO_GENERATE ({}) leaves no room for conversation within CONTEXT_LENGTH_MAX ({})",
                self.max_tokens_to_generate,
                self.context_length_max
            );
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_filename)
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))
}

fn parse_number(raw: &str, key: &str) -> Result<u64> {
    raw.trim()
        .parse()
        .with_context(|| format!("{} must be a non-negative integer, got '{}'", key, raw))
}

fn number_setting(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    from_file: Option<u64>,
    default: u64,
) -> Result<u64> {
    match env(key) {
        Some(raw) => parse_number(&raw, key),
        None => Ok(from_file.unwrap_or(default)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("DISCORD_TOKEN", "token"),
        ("DISCORD_OWNER_ID", "42"),
        ("OPENAI_API_KEY", "sk-test"),
    ];

    #[test]
    fn defaults_apply_when_only_required_values_are_set() {
        let config = Config::from_sources(None, env_from(REQUIRED)).unwrap();

        assert_eq!(config.owner_id, 42);
        assert_eq!(config.max_messages_in_history, 101);
        assert_eq!(config.max_tokens_to_generate, 301);
        assert_eq!(config.context_length_max, 4097);
        assert_eq!(config.database_path(), PathBuf::from("/data/db.sqlite"));
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert!(!config.debug_log_prompts);
    }

    #[test]
    fn environment_overrides_file() {
        let file = r#"
            [discord]
            token = "file-token"
            owner_id = 7

            [api]
            key = "file-key"
            model = "file-model"

            [conversation]
            max_messages_in_history = 20
            debug_log_prompts = true
        "#;
        let env = env_from(&[("DISCORD_OWNER_ID", "9"), ("MAX_MESSAGES_IN_HISTORY", "30")]);

        let config = Config::from_sources(Some(file), env).unwrap();

        assert_eq!(config.discord_token, "file-token");
        assert_eq!(config.owner_id, 9);
        assert_eq!(config.model, "file-model");
        assert_eq!(config.max_messages_in_history, 30);
        assert!(config.debug_log_prompts);
    }

    #[test]
    fn debug_flag_requires_literal_true() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("DEBUG_LOG_PROMPTS", "1"));
        let config = Config::from_sources(None, env_from(&pairs)).unwrap();
        assert!(!config.debug_log_prompts);
    }

    #[test]
    fn missing_token_is_rejected() {
        let env = env_from(&[("DISCORD_OWNER_ID", "1"), ("OPENAI_API_KEY", "k")]);
        assert!(Config::from_sources(None, env).is_err());
    }

    #[test]
    fn malformed_number_is_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("MAX_TOKENS_TO_GENERATE", "lots"));
        let err = Config::from_sources(None, env_from(&pairs)).unwrap_err();
        assert!(err.to_string().contains("MAX_TOKENS_TO_GENERATE"));
    }

    #[test]
    fn budget_that_leaves_no_room_is_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("MAX_TOKENS_TO_GENERATE", "5000"));
        assert!(Config::from_sources(None, env_from(&pairs)).is_err());
    }
}
