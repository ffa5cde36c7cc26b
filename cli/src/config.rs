use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use server::auth::AzureAdConfig;
use server::live_stream::LiveStreamOptions;
use server::operations::{ConnectionProfile, NamespaceRef, OperationOptions};
use std::collections::HashSet;
use std::path::Path;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
pub const ENV_PREFIX: &str = "BUSSCOPE";

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MIN_PAGE_SIZE: u32 = 1;
/// Largest peek page the broker serves in one call
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Invalid page_size: {configured} (min: {min_limit}, max: {max_limit})")]
    PageSize {
        configured: u32,
        min_limit: u32,
        max_limit: u32,
    },
    #[error("Invalid [operations] settings: {0}")]
    Operations(String),
    #[error("Invalid [stream] settings: {0}")]
    Stream(String),
    #[error("Invalid profile '{name}': {reason}")]
    Profile { name: String, reason: String },
    #[error("Duplicate profile name: {0}")]
    DuplicateProfile(String),
    #[error("Incomplete [azure_ad] settings: missing {0}")]
    AzureAd(&'static str),
}

impl ConfigValidationError {
    pub fn user_message(&self) -> String {
        match self {
            ConfigValidationError::PageSize {
                configured,
                min_limit,
                max_limit,
            } => format!(
                "Page size out of range: {configured}. \
                 Please set page_size to a value between {min_limit} and {max_limit}."
            ),
            ConfigValidationError::Operations(reason) => {
                format!("Operation settings are invalid: {reason}.")
            }
            ConfigValidationError::Stream(reason) => {
                format!("Stream settings are invalid: {reason}.")
            }
            ConfigValidationError::Profile { name, reason } => {
                format!("Connection profile '{name}' is invalid: {reason}.")
            }
            ConfigValidationError::DuplicateProfile(name) => {
                format!("More than one connection profile is named '{name}'.")
            }
            ConfigValidationError::AzureAd(field) => {
                format!("Azure AD sign-in needs {field}; set it under [azure_ad].")
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Configuration validation failed:\n{}", join_messages(.0))]
    Invalid(Vec<ConfigValidationError>),
}

fn join_messages(errors: &[ConfigValidationError]) -> String {
    errors
        .iter()
        .map(ConfigValidationError::user_message)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Logging configuration
#[derive(Debug, Deserialize, Default, Clone)]
pub struct LoggingConfig {
    level: Option<String>,
    file: Option<String>,
}

impl LoggingConfig {
    pub fn level(&self) -> &str {
        self.level.as_deref().unwrap_or("info")
    }

    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }
}

/// Main application configuration
#[derive(Debug, Deserialize, Default)]
pub struct AppConfig {
    page_size: Option<u32>,
    /// Connection string used when no profile is selected
    connection_string: Option<String>,
    /// Profile used when none is given on the command line
    default_profile: Option<String>,
    #[serde(default)]
    operations: OperationOptions,
    #[serde(default)]
    stream: LiveStreamOptions,
    #[serde(default)]
    azure_ad: AzureAdConfig,
    namespace: Option<NamespaceRef>,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    profiles: Vec<ConnectionProfile>,
}

impl AppConfig {
    pub fn page_size(&self) -> u32 {
        self.page_size.unwrap_or(DEFAULT_PAGE_SIZE)
    }

    pub fn connection_string(&self) -> Option<&str> {
        self.connection_string
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn default_profile(&self) -> Option<&str> {
        self.default_profile.as_deref()
    }

    pub fn operations(&self) -> &OperationOptions {
        &self.operations
    }

    pub fn stream(&self) -> &LiveStreamOptions {
        &self.stream
    }

    pub fn azure_ad(&self) -> &AzureAdConfig {
        &self.azure_ad
    }

    pub fn namespace(&self) -> Option<&NamespaceRef> {
        self.namespace.as_ref()
    }

    pub fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    pub fn profiles(&self) -> &[ConnectionProfile] {
        &self.profiles
    }

    /// Profile with this name, compared case-insensitively.
    pub fn profile(&self, name: &str) -> Option<&ConnectionProfile> {
        self.profiles
            .iter()
            .find(|profile| profile.name.eq_ignore_ascii_case(name.trim()))
    }

    /// Validate the configuration against defined limits
    pub fn validate(&self) -> Result<(), Vec<ConfigValidationError>> {
        let mut errors = Vec::new();

        let page_size = self.page_size();
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            errors.push(ConfigValidationError::PageSize {
                configured: page_size,
                min_limit: MIN_PAGE_SIZE,
                max_limit: MAX_PAGE_SIZE,
            });
        }

        if let Err(e) = self.operations.validate() {
            errors.push(ConfigValidationError::Operations(e.to_string()));
        }
        if let Err(e) = self.stream.validate() {
            errors.push(ConfigValidationError::Stream(e.to_string()));
        }

        let mut seen = HashSet::new();
        for profile in &self.profiles {
            if !seen.insert(profile.name.to_lowercase()) {
                errors.push(ConfigValidationError::DuplicateProfile(profile.name.clone()));
            }
            if let Err(e) = profile.validate() {
                errors.push(ConfigValidationError::Profile {
                    name: profile.name.clone(),
                    reason: e.user_message(),
                });
            }
        }

        if self.namespace.is_some() {
            let required = [
                ("tenant_id", &self.azure_ad.tenant_id),
                ("client_id", &self.azure_ad.client_id),
                ("client_secret", &self.azure_ad.client_secret),
            ];
            for (field, value) in required {
                if value.as_deref().is_none_or(|v| v.trim().is_empty()) {
                    errors.push(ConfigValidationError::AzureAd(field));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Loads `.env`, then the configuration file, then `BUSSCOPE__*` environment
/// variables, later sources overriding earlier ones.
///
/// Without an explicit `path`, a missing `config.toml` is not an error.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigLoadError> {
    dotenv::dotenv().ok();

    let file_source = match path {
        Some(path) => File::from(path).required(true),
        None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
    };
    let env_source = Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true);

    build_config(Config::builder().add_source(file_source).add_source(env_source))
}

fn build_config(builder: ConfigBuilder<DefaultState>) -> Result<AppConfig, ConfigLoadError> {
    let config: AppConfig = builder.build()?.try_deserialize()?;
    config.validate().map_err(ConfigLoadError::Invalid)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};
    use config::FileFormat;
    use server::operations::ProfileKind;

    fn parse(toml: &str) -> Result<AppConfig, ConfigLoadError> {
        build_config(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = assert_ok!(parse(""));
        assert_eq!(config.page_size(), DEFAULT_PAGE_SIZE);
        assert_eq!(config.logging().level(), "info");
        assert!(config.connection_string().is_none());
        assert_eq!(config.stream().buffer_capacity(), 500);
    }

    #[test]
    fn sections_and_profiles_are_read() {
        let config = assert_ok!(parse(
            r#"
            page_size = 25

            [operations]
            purge_batch_size = 10

            [stream]
            poll_interval_ms = 250

            [[profiles]]
            name = "Dev Orders"
            kind = "Queue"
            entity_name = "orders"
            connection_string = "Endpoint=sb://dev.servicebus.windows.net/;SharedAccessKeyName=root;SharedAccessKey=abc="
            "#
        ));

        assert_eq!(config.page_size(), 25);
        assert_eq!(config.operations().purge_batch_size(), 10);
        assert_eq!(config.stream().poll_interval().as_millis(), 250);

        let profile = config.profile("dev orders").unwrap();
        assert_eq!(profile.kind, ProfileKind::Queue);
    }

    #[test]
    fn out_of_range_page_size_is_rejected() {
        let error = assert_err!(parse("page_size = 0"));
        assert!(matches!(error, ConfigLoadError::Invalid(ref errors)
            if matches!(errors[0], ConfigValidationError::PageSize { configured: 0, .. })));
    }

    #[test]
    fn namespace_without_credentials_is_rejected() {
        let error = assert_err!(parse(
            r#"
            [namespace]
            subscription_id = "sub"
            resource_group = "rg"
            namespace = "demo"

            [azure_ad]
            tenant_id = "tenant"
            "#
        ));
        let ConfigLoadError::Invalid(errors) = error else {
            panic!("expected validation errors");
        };
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn duplicate_profile_names_are_rejected() {
        let error = assert_err!(parse(
            r#"
            [[profiles]]
            name = "dev"
            connection_string = "Endpoint=sb://a.servicebus.windows.net/;SharedAccessKeyName=k;SharedAccessKey=v"

            [[profiles]]
            name = "DEV"
            connection_string = "Endpoint=sb://b.servicebus.windows.net/;SharedAccessKeyName=k;SharedAccessKey=v"
            "#
        ));
        assert!(error.to_string().contains("'DEV'"));
    }
}
