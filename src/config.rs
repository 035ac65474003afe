//! Runtime configuration, read from the environment.

use std::env;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct FamilyConfig {
    pub database: DatabaseConfig,
    pub merge: MergeConfig,
    pub log_filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct MergeConfig {
    pub duplicate_matching: DuplicateMatching,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateMatching {
    /// Case-insensitive first and last name plus exact birth date.
    #[default]
    NameAndBirthDate,
    /// Every source person becomes a new group-tree person.
    Disabled,
}

impl DuplicateMatching {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "name_and_birth_date" => Some(Self::NameAndBirthDate),
            "disabled" | "none" | "off" => Some(Self::Disabled),
            _ => None,
        }
    }
}

impl FamilyConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("FAMILY_DATABASE_URL").filter(|url| !url.trim().is_empty()) {
            config.database.url = Some(url);
        }
        if let Some(raw) = lookup("FAMILY_DATABASE_MAX_CONNECTIONS") {
            config.database.max_connections = raw.trim().parse().with_context(|| {
                format!("invalid FAMILY_DATABASE_MAX_CONNECTIONS '{}'", raw)
            })?;
        }
        if let Some(raw) = lookup("FAMILY_DUPLICATE_MATCHING") {
            config.merge.duplicate_matching = DuplicateMatching::parse(&raw)
                .ok_or_else(|| anyhow!("invalid FAMILY_DUPLICATE_MATCHING '{}'", raw))?;
        }
        if let Some(filter) = lookup("FAMILY_LOG_FILTER") {
            config.log_filter = Some(filter);
        }

        Ok(config)
    }
}
