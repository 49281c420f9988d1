use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, str::FromStr, time::Duration};
use thiserror::Error;

/// Limits and timeouts applied by the facade.
///
/// The dispatch tick is fixed and not part of the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// How long a facade call waits for its completion. `None` waits indefinitely.
    #[serde(default, with = "option_duration_ms")]
    pub request_timeout: Option<Duration>,

    #[serde(default = "default_max_key_length")]
    pub max_key_length: usize,

    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,

    #[serde(default = "default_max_value_bytes")]
    pub max_value_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: None,
            max_key_length: default_max_key_length(),
            max_page_size: default_max_page_size(),
            max_value_bytes: default_max_value_bytes(),
        }
    }
}

impl ClientConfig {
    // JSONファイルから設定を読み込む
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let file = File::open(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let reader = BufReader::new(file);
        let config: Self =
            serde_json::from_reader(reader).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_key_length == 0 {
            return Err(ConfigError::Invalid(
                "max_key_length must be greater than 0".to_string(),
            ));
        }
        if self.max_page_size == 0 {
            return Err(ConfigError::Invalid(
                "max_page_size must be greater than 0".to_string(),
            ));
        }
        if self.max_value_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_value_bytes must be greater than 0".to_string(),
            ));
        }
        if self.request_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid(
                "request_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl FromStr for ClientConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(String),
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// 既定値
fn default_max_key_length() -> usize {
    50
}

fn default_max_page_size() -> usize {
    100
}

fn default_max_value_bytes() -> usize {
    4 * 1024 * 1024
}

pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

pub mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => super::duration_ms::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
