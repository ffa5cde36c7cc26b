use super::provider::{AuthProvider, AuthToken};
use crate::common::ServiceBusError;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Refresh this long before the token actually expires.
const EXPIRY_MARGIN: Duration = Duration::from_secs(300);

/// Service principal settings for the OAuth2 client credentials grant.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct AzureAdConfig {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub authority_host: Option<String>,
    pub scope: Option<String>,
}

/// Token provider using the client credentials flow, caching the token until
/// shortly before it expires.
pub struct ClientCredentialsProvider {
    config: AzureAdConfig,
    http_client: reqwest::Client,
    cached: Mutex<Option<(AuthToken, Instant)>>,
}

fn field(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or_default()
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
    error_description: Option<String>,
}

impl ClientCredentialsProvider {
    pub fn new(config: AzureAdConfig) -> Result<Self, ServiceBusError> {
        for (name, value) in [
            ("tenant_id", &config.tenant_id),
            ("client_id", &config.client_id),
            ("client_secret", &config.client_secret),
        ] {
            if value.as_deref().is_none_or(|v| v.trim().is_empty()) {
                return Err(ServiceBusError::ConfigurationError(format!(
                    "Azure AD {name} is required"
                )));
            }
        }

        Ok(Self {
            config,
            http_client: reqwest::Client::new(),
            cached: Mutex::new(None),
        })
    }

    fn authority_host(&self) -> &str {
        self.config
            .authority_host
            .as_deref()
            .unwrap_or("https://login.microsoftonline.com")
            .trim_end_matches('/')
    }

    fn scope(&self) -> &str {
        self.config
            .scope
            .as_deref()
            .unwrap_or("https://management.azure.com/.default")
    }

    /// Token endpoint and form fields for the client credentials grant.
    fn token_request(&self) -> (String, [(&'static str, &str); 4]) {
        let token_url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host(),
            field(&self.config.tenant_id)
        );
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", field(&self.config.client_id)),
            ("client_secret", field(&self.config.client_secret)),
            ("scope", self.scope()),
        ];
        (token_url, params)
    }

    async fn request_token(&self) -> Result<AuthToken, ServiceBusError> {
        let (token_url, params) = self.token_request();

        let response = self
            .http_client
            .post(&token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                ServiceBusError::AuthenticationFailed(format!("Failed to request token: {e}"))
            })?;

        if !response.status().is_success() {
            let error_info = response
                .json::<ErrorResponse>()
                .await
                .unwrap_or(ErrorResponse {
                    error: "unknown_error".to_string(),
                    error_description: None,
                });

            let user_friendly_message = match error_info.error.as_str() {
                "invalid_client" => "Invalid client id or secret",
                "unauthorized_client" => "The application is not authorized for this tenant",
                "invalid_scope" => "The requested scope is not valid",
                _ => error_info
                    .error_description
                    .as_deref()
                    .unwrap_or(&error_info.error),
            };
            return Err(ServiceBusError::AuthenticationFailed(format!(
                "Authentication failed: {user_friendly_message}"
            )));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            ServiceBusError::AuthenticationFailed(format!("Failed to parse token response: {e}"))
        })?;

        Ok(AuthToken {
            token: token.access_token,
            token_type: token.token_type,
            expires_in_secs: Some(token.expires_in),
        })
    }
}

#[async_trait]
impl AuthProvider for ClientCredentialsProvider {
    async fn authenticate(&self) -> Result<AuthToken, ServiceBusError> {
        let mut cached = self.cached.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if Instant::now() + EXPIRY_MARGIN < *expires_at {
                return Ok(token.clone());
            }
            log::debug!("Cached management token is about to expire, refreshing");
        }

        let token = self.request_token().await?;
        let lifetime = Duration::from_secs(token.expires_in_secs.unwrap_or(3600));
        *cached = Some((token.clone(), Instant::now() + lifetime));
        Ok(token)
    }

    async fn refresh(&self) -> Result<AuthToken, ServiceBusError> {
        self.cached.lock().await.take();
        self.authenticate().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_secret_is_a_configuration_error() {
        let config = AzureAdConfig {
            tenant_id: Some("tenant".into()),
            client_id: Some("client".into()),
            ..Default::default()
        };
        let err = ClientCredentialsProvider::new(config).err();
        assert!(matches!(err, Some(ServiceBusError::ConfigurationError(_))));
    }

    #[test]
    fn token_request_uses_the_configured_principal() {
        let config = AzureAdConfig {
            tenant_id: Some("contoso".into()),
            client_id: Some("client".into()),
            client_secret: Some("secret".into()),
            ..Default::default()
        };
        let provider = ClientCredentialsProvider::new(config).unwrap();

        let (url, params) = provider.token_request();
        assert!(url.ends_with("/contoso/oauth2/v2.0/token"));
        assert_eq!(params[1], ("client_id", "client"));
        assert_eq!(params[2], ("client_secret", "secret"));
        assert_eq!(params[3], ("scope", "https://management.azure.com/.default"));
    }
}
