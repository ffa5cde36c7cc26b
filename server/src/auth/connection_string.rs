use crate::common::ServiceBusError;

const SERVICE_BUS_SUFFIX: &str = ".servicebus.windows.net";

/// Components of a Service Bus connection string.
///
/// Keys are matched case-insensitively; unknown keys are ignored. Either a
/// shared access key pair or a shared access signature must be present.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionStringInfo {
    /// Fully qualified namespace, e.g. `contoso.servicebus.windows.net`
    pub fully_qualified_namespace: String,
    pub shared_access_key_name: Option<String>,
    pub shared_access_key: Option<String>,
    pub shared_access_signature: Option<String>,
    /// Entity the connection string is scoped to, if any
    pub entity_path: Option<String>,
}

impl std::fmt::Debug for ConnectionStringInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStringInfo")
            .field("fully_qualified_namespace", &self.fully_qualified_namespace)
            .field("shared_access_key_name", &self.shared_access_key_name)
            .field("entity_path", &self.entity_path)
            .finish_non_exhaustive()
    }
}

impl ConnectionStringInfo {
    pub fn parse(connection_string: &str) -> Result<Self, ServiceBusError> {
        if connection_string.trim().is_empty() {
            return Err(ServiceBusError::ConfigurationError(
                "Connection string cannot be empty".to_string(),
            ));
        }

        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        let mut signature = None;
        let mut entity_path = None;

        for part in connection_string.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            // Values (keys, signatures) may contain '=' themselves
            let Some((name, value)) = part.split_once('=') else {
                return Err(ServiceBusError::ConfigurationError(format!(
                    "Malformed connection string segment '{}'",
                    name_only(part)
                )));
            };
            let value = value.trim().to_string();
            match name.trim().to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(value),
                "sharedaccesskeyname" => key_name = Some(value),
                "sharedaccesskey" => key = Some(value),
                "sharedaccesssignature" => signature = Some(value),
                "entitypath" => entity_path = Some(value).filter(|v| !v.is_empty()),
                _ => {}
            }
        }

        let endpoint = endpoint.ok_or_else(|| {
            ServiceBusError::ConfigurationError("Missing Endpoint in connection string".to_string())
        })?;

        if signature.is_none() {
            if key_name.is_none() {
                return Err(ServiceBusError::ConfigurationError(
                    "Missing SharedAccessKeyName in connection string".to_string(),
                ));
            }
            if key.is_none() {
                return Err(ServiceBusError::ConfigurationError(
                    "Missing SharedAccessKey in connection string".to_string(),
                ));
            }
        }

        Ok(Self {
            fully_qualified_namespace: normalize_endpoint(&endpoint)?,
            shared_access_key_name: key_name,
            shared_access_key: key,
            shared_access_signature: signature,
            entity_path,
        })
    }

    /// Namespace name without the service suffix.
    pub fn namespace(&self) -> &str {
        self.fully_qualified_namespace
            .split('.')
            .next()
            .unwrap_or(&self.fully_qualified_namespace)
    }

    /// Endpoint in the `sb://` form used by connection strings.
    pub fn endpoint(&self) -> String {
        format!("sb://{}/", self.fully_qualified_namespace)
    }
}

fn name_only(segment: &str) -> &str {
    segment.split('=').next().unwrap_or(segment)
}

/// Normalizes user-supplied endpoints to a fully qualified namespace.
///
/// Accepts `sb://ns.servicebus.windows.net/`, `https://ns.servicebus.windows.net`,
/// `ns.servicebus.windows.net` and a bare `ns`.
pub fn normalize_endpoint(endpoint: &str) -> Result<String, ServiceBusError> {
    let trimmed = endpoint.trim();
    let without_scheme = trimmed
        .split_once("://")
        .map_or(trimmed, |(_, rest)| rest);
    let host = without_scheme
        .split('/')
        .next()
        .unwrap_or_default()
        .split(':')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();

    if host.is_empty() || host.starts_with('.') {
        return Err(ServiceBusError::ConfigurationError(format!(
            "Invalid Service Bus endpoint '{trimmed}'"
        )));
    }

    if host.contains('.') {
        Ok(host)
    } else {
        Ok(format!("{host}{SERVICE_BUS_SUFFIX}"))
    }
}
