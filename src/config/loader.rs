//! Configuration loader with environment variable expansion

use super::{Config, ConfigError};
use lazy_static::lazy_static;
use regex_lite::Regex;
use std::path::Path;

lazy_static! {
    // ${VAR} or ${VAR:-default}
    static ref ENV_VAR: Regex =
        Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").expect("valid env var pattern");
}

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn parse(content: &str) -> Result<Config, ConfigError> {
        let expanded = Self::expand_env_vars(content);
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Expand `${VAR}` and `${VAR:-default}`.
    ///
    /// An unset variable without a default keeps its placeholder.
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR
            .replace_all(content, |caps: &regex_lite::Captures| {
                match (std::env::var(&caps[1]), caps.get(2)) {
                    (Ok(value), _) => value,
                    (Err(_), Some(default)) => default.as_str().to_string(),
                    (Err(_), None) => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TUS_LOADER_TEST_VAR", "test_value");
        let expanded = ConfigLoader::expand_env_vars("key: ${TUS_LOADER_TEST_VAR}");
        assert_eq!(expanded, "key: test_value");
        std::env::remove_var("TUS_LOADER_TEST_VAR");
    }

    #[test]
    fn test_expand_env_vars_default_and_missing() {
        let expanded = ConfigLoader::expand_env_vars(
            "a: ${TUS_LOADER_UNSET_VAR:-fallback}\nb: ${TUS_LOADER_UNSET_VAR}",
        );
        assert_eq!(expanded, "a: fallback\nb: ${TUS_LOADER_UNSET_VAR}");
    }
}
