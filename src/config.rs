use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serenity::model::id::GuildId;

use crate::error::ConfigError;

const DEFAULT_DATA_FILE: &str = "user_times.json";
const DEFAULT_SAVE_INTERVAL_SECS: u64 = 60;
const DEFAULT_PREFIX: &str = "!";
/// Discord allows at most this many lines per ranking embed.
const MAX_RANKING_LIMIT: usize = 25;

#[derive(Debug, Clone, PartialEq)]
pub enum StorageConfig {
    File { path: PathBuf },
    Postgres { url: String, require_ssl: bool },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub discord_token: String,
    pub guild_id: GuildId,
    pub storage: StorageConfig,
    pub save_interval: Duration,
    pub command_prefix: String,
    pub ranking_limit: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &'static str| lookup(name).filter(|v| !v.trim().is_empty());
        let require = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let discord_token = require("DISCORD_TOKEN")?;

        let guild_raw = require("GUILD_ID")?;
        let guild_id = match guild_raw.trim().parse::<u64>() {
            Ok(id) if id != 0 => GuildId::new(id),
            _ => return Err(invalid("GUILD_ID", &guild_raw, "expected a non-zero snowflake")),
        };

        let storage = match get("DATABASE_URL") {
            Some(url) => StorageConfig::Postgres {
                url,
                require_ssl: parse_or("DATABASE_SSL", get("DATABASE_SSL"), true)?,
            },
            None => StorageConfig::File {
                path: PathBuf::from(get("DATA_FILE").unwrap_or_else(|| DEFAULT_DATA_FILE.into())),
            },
        };

        let interval_secs: u64 =
            parse_or("SAVE_INTERVAL_SECS", get("SAVE_INTERVAL_SECS"), DEFAULT_SAVE_INTERVAL_SECS)?;
        if interval_secs == 0 {
            return Err(invalid("SAVE_INTERVAL_SECS", "0", "must be positive"));
        }

        let ranking_limit: usize =
            parse_or("RANKING_LIMIT", get("RANKING_LIMIT"), MAX_RANKING_LIMIT)?;
        if !(1..=MAX_RANKING_LIMIT).contains(&ranking_limit) {
            return Err(invalid(
                "RANKING_LIMIT",
                &ranking_limit.to_string(),
                &format!("must be between 1 and {MAX_RANKING_LIMIT}"),
            ));
        }

        Ok(Self {
            discord_token,
            guild_id,
            storage,
            save_interval: Duration::from_secs(interval_secs),
            command_prefix: get("COMMAND_PREFIX").unwrap_or_else(|| DEFAULT_PREFIX.into()),
            ranking_limit,
        })
    }
}

fn parse_or<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(name, &value, &e.to_string())),
    }
}

fn invalid(name: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
