use crate::common::ServiceBusError;
use async_trait::async_trait;

/// Bearer token for Azure Resource Manager calls.
#[derive(Clone, Debug)]
pub struct AuthToken {
    pub token: String,
    /// Always "Bearer" for Resource Manager
    pub token_type: String,
    /// Lifetime reported by the issuer, if any
    pub expires_in_secs: Option<u64>,
}

/// Source of Azure AD tokens for credential mode.
///
/// # Examples
///
/// ```no_run
/// use async_trait::async_trait;
/// use server::auth::{AuthProvider, AuthToken};
/// use server::common::ServiceBusError;
///
/// /// Reads a token exported by a deployment pipeline.
/// struct PipelineToken;
///
/// #[async_trait]
/// impl AuthProvider for PipelineToken {
///     async fn authenticate(&self) -> Result<AuthToken, ServiceBusError> {
///         let token = std::env::var("ARM_ACCESS_TOKEN")
///             .map_err(|e| ServiceBusError::AuthenticationFailed(e.to_string()))?;
///         Ok(AuthToken { token, token_type: "Bearer".into(), expires_in_secs: None })
///     }
/// }
/// ```
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Performs authentication and returns an access token.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceBusError::AuthenticationFailed`] when no token can be obtained.
    async fn authenticate(&self) -> Result<AuthToken, ServiceBusError>;

    /// Obtains a fresh token. Defaults to authenticating again.
    async fn refresh(&self) -> Result<AuthToken, ServiceBusError> {
        self.authenticate().await
    }
}

/// Provider returning a token obtained elsewhere, e.g. from `az account get-access-token`.
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl AuthProvider for StaticTokenProvider {
    async fn authenticate(&self) -> Result<AuthToken, ServiceBusError> {
        if self.token.trim().is_empty() {
            return Err(ServiceBusError::AuthenticationFailed(
                "Access token is empty".to_string(),
            ));
        }
        Ok(AuthToken {
            token: self.token.clone(),
            token_type: "Bearer".to_string(),
            expires_in_secs: None,
        })
    }
}
