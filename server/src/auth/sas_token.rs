use crate::common::ServiceBusError;
use base64::{Engine as _, engine::general_purpose};
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Generator for Shared Access Signature tokens over one resource URI.
///
/// Tokens are signed with HMAC-SHA256 using the shared access key exactly as
/// it appears in the connection string; the key is not base64 decoded first.
///
/// # Examples
///
/// ```no_run
/// use server::auth::SasTokenGenerator;
///
/// let generator = SasTokenGenerator::for_namespace(
///     "contoso.servicebus.windows.net",
///     "RootManageSharedAccessKey",
///     "base64_encoded_key",
/// );
/// let token = generator.generate_sas_token(chrono::Duration::hours(1))?;
/// # Ok::<(), server::common::ServiceBusError>(())
/// ```
#[derive(Clone)]
pub struct SasTokenGenerator {
    resource_uri: String,
    key_name: String,
    key: String,
}

impl std::fmt::Debug for SasTokenGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SasTokenGenerator")
            .field("resource_uri", &self.resource_uri)
            .field("key_name", &self.key_name)
            .finish_non_exhaustive()
    }
}

impl SasTokenGenerator {
    pub fn new(
        resource_uri: impl Into<String>,
        key_name: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            resource_uri: resource_uri.into(),
            key_name: key_name.into(),
            key: key.into(),
        }
    }

    /// Generator whose tokens grant access to the whole namespace over HTTPS.
    pub fn for_namespace(
        fully_qualified_namespace: &str,
        key_name: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self::new(
            format!("https://{fully_qualified_namespace}/"),
            key_name,
            key,
        )
    }

    pub fn resource_uri(&self) -> &str {
        &self.resource_uri
    }

    /// Token valid from now for `validity`.
    pub fn generate_sas_token(&self, validity: Duration) -> Result<String, ServiceBusError> {
        let expiry = Utc::now() + validity;
        self.sign_until(expiry.timestamp())
    }

    fn sign_until(&self, expiry_timestamp: i64) -> Result<String, ServiceBusError> {
        let encoded_uri = urlencoding::encode(&self.resource_uri);
        let string_to_sign = format!("{encoded_uri}\n{expiry_timestamp}");

        let mut mac = HmacSha256::new_from_slice(self.key.as_bytes()).map_err(|e| {
            ServiceBusError::AuthenticationFailed(format!("Failed to create HMAC: {e}"))
        })?;
        mac.update(string_to_sign.as_bytes());
        let signature = general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        Ok(format!(
            "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
            encoded_uri,
            urlencoding::encode(&signature),
            expiry_timestamp,
            urlencoding::encode(&self.key_name)
        ))
    }
}
