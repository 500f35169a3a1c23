//! Plain configuration structs consumed by the feature and split engines.

use std::str::FromStr;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::window::{parse_windows, Window};

pub const DEFAULT_TIMEZONE: &str = "America/Argentina/Buenos_Aires";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKey {
    User,
    Ip,
    Device,
}

impl EntityKey {
    pub const ALL: [EntityKey; 3] = [EntityKey::User, EntityKey::Ip, EntityKey::Device];

    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        match input.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "ip" => Ok(Self::Ip),
            "device" => Ok(Self::Device),
            _ => Err(ConfigError::UnknownEntity(input.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Ip => "ip",
            Self::Device => "device",
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            Self::User => "user_id",
            Self::Ip => "ip_hash",
            Self::Device => "device_fingerprint_hash",
        }
    }
}

impl FromStr for EntityKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LoginAttempt,
    CheckoutAttempt,
}

impl EventKind {
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        match input.trim() {
            "login_attempt" => Ok(Self::LoginAttempt),
            "checkout_attempt" => Ok(Self::CheckoutAttempt),
            other => Err(ConfigError::UnknownEventKind(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LoginAttempt => "login_attempt",
            Self::CheckoutAttempt => "checkout_attempt",
        }
    }

    pub fn counterpart(self) -> Self {
        match self {
            Self::LoginAttempt => Self::CheckoutAttempt,
            Self::CheckoutAttempt => Self::LoginAttempt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub timezone: String,
    pub seed: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            timezone: DEFAULT_TIMEZONE.to_string(),
            seed: 1337,
        }
    }
}

impl RunConfig {
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        parse_timezone(&self.timezone)
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz, ConfigError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| ConfigError::UnknownTimezone(name.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub windows: Vec<String>,
    pub entities: Vec<EntityKey>,
    pub strict_past_only: bool,
    pub include_support: bool,
    pub include_cross_event: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            windows: ["1h", "6h", "24h", "7d"]
                .iter()
                .map(|w| w.to_string())
                .collect(),
            entities: EntityKey::ALL.to_vec(),
            strict_past_only: true,
            include_support: true,
            include_cross_event: true,
        }
    }
}

impl FeatureConfig {
    pub fn validate(&self) -> Result<Vec<Window>, ConfigError> {
        if self.entities.is_empty() {
            return Err(ConfigError::EmptyEntities);
        }
        parse_windows(&self.windows)
    }

    pub fn unique_entities(&self) -> Vec<EntityKey> {
        let mut out: Vec<EntityKey> = Vec::with_capacity(self.entities.len());
        for entity in &self.entities {
            if !out.contains(entity) {
                out.push(*entity);
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub time_split: f64,
    pub user_holdout_frac: f64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            time_split: 0.85,
            user_holdout_frac: 0.15,
        }
    }
}

impl SplitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_open_fraction("time_split", self.time_split)?;
        check_open_fraction("user_holdout_frac", self.user_holdout_frac)
    }
}

fn check_open_fraction(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidFraction { field, value })
    }
}
