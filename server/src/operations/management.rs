//! Azure Resource Manager calls for one Service Bus namespace: entity
//! listings with counts and the `listKeys` call used by credential mode.

use crate::common::{ServiceBusError, ServiceBusResult};
use crate::model::{EntityDescriptor, EntityKind};
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use std::time::Duration;

pub const AZURE_MANAGEMENT_URL: &str = "https://management.azure.com";
const API_VERSION_SERVICE_BUS: &str = "2021-11-01";
const DEFAULT_AUTHORIZATION_RULE: &str = "RootManageSharedAccessKey";

/// Coordinates of a namespace in Azure Resource Manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct NamespaceRef {
    pub subscription_id: String,
    pub resource_group: String,
    pub namespace: String,
}

impl NamespaceRef {
    pub fn new(
        subscription_id: impl Into<String>,
        resource_group: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            resource_group: resource_group.into(),
            namespace: namespace.into(),
        }
    }

    /// Parses `/subscriptions/{id}/resourceGroups/{rg}/providers/Microsoft.ServiceBus/namespaces/{ns}`.
    pub fn from_resource_id(resource_id: &str) -> ServiceBusResult<Self> {
        let parts: Vec<&str> = resource_id.trim_matches('/').split('/').collect();
        match parts.as_slice() {
            [subs, subscription_id, rgs, resource_group, providers, _, nss, namespace, ..]
                if subs.eq_ignore_ascii_case("subscriptions")
                    && rgs.eq_ignore_ascii_case("resourceGroups")
                    && providers.eq_ignore_ascii_case("providers")
                    && nss.eq_ignore_ascii_case("namespaces") =>
            {
                Ok(Self::new(*subscription_id, *resource_group, *namespace))
            }
            _ => Err(ServiceBusError::ConfigurationError(format!(
                "Invalid namespace resource ID '{resource_id}'"
            ))),
        }
    }

    fn path(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ServiceBus/namespaces/{}",
            self.subscription_id, self.resource_group, self.namespace
        )
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    value: Vec<T>,
    #[serde(rename = "nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccessKeys {
    #[serde(rename = "primaryConnectionString")]
    primary_connection_string: String,
}

#[derive(Debug, Deserialize)]
struct EntityResource {
    name: String,
    #[serde(default)]
    properties: EntityProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityProperties {
    #[serde(default)]
    requires_session: bool,
    #[serde(default)]
    count_details: CountDetails,
    #[serde(default)]
    size_in_bytes: i64,
    default_message_time_to_live: Option<String>,
    lock_duration: Option<String>,
    /// Reported for subscriptions, which have no countDetails.scheduledMessageCount
    message_count: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountDetails {
    #[serde(default)]
    active_message_count: i64,
    #[serde(default)]
    dead_letter_message_count: i64,
    #[serde(default)]
    scheduled_message_count: i64,
}

impl EntityResource {
    fn into_descriptor(self, kind: EntityKind, parent_topic: Option<&str>) -> EntityDescriptor {
        let props = self.properties;
        let active = if props.count_details.active_message_count == 0 {
            // Older API versions only report the aggregate
            props.message_count.unwrap_or(0)
        } else {
            props.count_details.active_message_count
        };
        EntityDescriptor {
            name: self.name,
            kind,
            parent_topic: parent_topic.map(str::to_string),
            requires_session: props.requires_session,
            active_count: active,
            dead_letter_count: props.count_details.dead_letter_message_count,
            scheduled_count: props.count_details.scheduled_message_count,
            size_bytes: props.size_in_bytes,
            default_ttl: props
                .default_message_time_to_live
                .as_deref()
                .and_then(parse_iso8601_duration),
            lock_duration: props.lock_duration.as_deref().and_then(parse_iso8601_duration),
        }
    }
}

/// Parses the ISO-8601 durations ARM uses, e.g. `P14D`, `PT1M`, `PT30.5S`,
/// and the "infinite" `P10675199DT2H48M5.4775807S`. Years and months are
/// approximated as 365 and 30 days.
pub fn parse_iso8601_duration(text: &str) -> Option<Duration> {
    let rest = text.trim().strip_prefix('P').or_else(|| text.trim().strip_prefix('p'))?;
    if rest.is_empty() {
        return None;
    }

    let mut total = 0f64;
    let mut in_time = false;
    let mut number = String::new();
    let mut saw_component = false;

    for ch in rest.chars() {
        match ch {
            'T' | 't' => {
                if in_time || !number.is_empty() {
                    return None;
                }
                in_time = true;
            }
            '0'..='9' | '.' | ',' => number.push(if ch == ',' { '.' } else { ch }),
            unit => {
                let value: f64 = number.parse().ok()?;
                number.clear();
                let seconds = match (in_time, unit.to_ascii_uppercase()) {
                    (false, 'Y') => 365.0 * 86_400.0,
                    (false, 'M') => 30.0 * 86_400.0,
                    (false, 'W') => 7.0 * 86_400.0,
                    (false, 'D') => 86_400.0,
                    (true, 'H') => 3_600.0,
                    (true, 'M') => 60.0,
                    (true, 'S') => 1.0,
                    _ => return None,
                };
                total += value * seconds;
                saw_component = true;
            }
        }
    }

    if !number.is_empty() || !saw_component || !total.is_finite() {
        return None;
    }
    Duration::try_from_secs_f64(total).ok()
}

/// Thin `reqwest` client for the Service Bus resource provider.
#[derive(Debug, Clone)]
pub struct ManagementClient {
    client: reqwest::Client,
    base_url: String,
}

impl Default for ManagementClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagementClient {
    pub fn new() -> Self {
        Self::with_base_url(AZURE_MANAGEMENT_URL)
    }

    /// Points the client at another ARM endpoint (sovereign clouds, test servers).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn list_queues(
        &self,
        token: &str,
        namespace: &NamespaceRef,
    ) -> ServiceBusResult<Vec<EntityDescriptor>> {
        let url = self.url(&format!("{}/queues", namespace.path()));
        let resources = self.get_all(token, url, "list queues", &namespace.namespace).await?;
        Ok(resources
            .into_iter()
            .map(|r| r.into_descriptor(EntityKind::Queue, None))
            .collect())
    }

    pub async fn list_topics(
        &self,
        token: &str,
        namespace: &NamespaceRef,
    ) -> ServiceBusResult<Vec<EntityDescriptor>> {
        let url = self.url(&format!("{}/topics", namespace.path()));
        let resources = self.get_all(token, url, "list topics", &namespace.namespace).await?;
        Ok(resources
            .into_iter()
            .map(|r| r.into_descriptor(EntityKind::Topic, None))
            .collect())
    }

    /// Fails with [`ServiceBusError::EntityNotFound`] when the topic does not exist.
    pub async fn list_subscriptions(
        &self,
        token: &str,
        namespace: &NamespaceRef,
        topic: &str,
    ) -> ServiceBusResult<Vec<EntityDescriptor>> {
        let url = self.url(&format!("{}/topics/{}/subscriptions", namespace.path(), topic));
        let resources = self.get_all(token, url, "list subscriptions", topic).await?;
        Ok(resources
            .into_iter()
            .map(|r| r.into_descriptor(EntityKind::Subscription, Some(topic)))
            .collect())
    }

    /// Primary connection string of the namespace's `RootManageSharedAccessKey` rule.
    pub async fn get_namespace_connection_string(
        &self,
        token: &str,
        namespace: &NamespaceRef,
    ) -> ServiceBusResult<String> {
        let url = self.url(&format!(
            "{}/authorizationRules/{}/listKeys",
            namespace.path(),
            DEFAULT_AUTHORIZATION_RULE
        ));

        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(CONTENT_TYPE, "application/json")
            .body("{}") // ARM POST requests need a JSON body
            .send()
            .await
            .map_err(|e| ServiceBusError::transport("list keys", &namespace.namespace, e))?;

        let response = check_status(response, "list keys", &namespace.namespace).await?;
        let keys: AccessKeys = response.json().await.map_err(|e| {
            ServiceBusError::transport("list keys", &namespace.namespace, format!("bad response: {e}"))
        })?;
        Ok(keys.primary_connection_string)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}?api-version={}", self.base_url, path, API_VERSION_SERVICE_BUS)
    }

    async fn get_all(
        &self,
        token: &str,
        first_url: String,
        operation: &str,
        entity: &str,
    ) -> ServiceBusResult<Vec<EntityResource>> {
        let mut resources = Vec::new();
        let mut next = Some(first_url);

        while let Some(url) = next {
            log::debug!("GET {url}");
            let response = self
                .client
                .get(&url)
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .send()
                .await
                .map_err(|e| ServiceBusError::transport(operation, entity, e))?;

            let response = check_status(response, operation, entity).await?;
            let page: ListResponse<EntityResource> = response.json().await.map_err(|e| {
                ServiceBusError::transport(operation, entity, format!("bad response: {e}"))
            })?;
            resources.extend(page.value);
            next = page.next_link.filter(|link| !link.is_empty());
        }

        Ok(resources)
    }
}

pub(super) async fn check_status(
    response: reqwest::Response,
    operation: &str,
    entity: &str,
) -> ServiceBusResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let error_text = response.text().await.unwrap_or_default();
    log::error!("{operation} on {entity} failed: {status} - {error_text}");
    match status {
        StatusCode::NOT_FOUND => Err(ServiceBusError::EntityNotFound(entity.to_string())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ServiceBusError::transport(
            operation,
            entity,
            format!("access denied ({status})"),
        )),
        _ => Err(ServiceBusError::transport(
            operation,
            entity,
            format!("{status} - {error_text}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_durations() {
        assert_eq!(parse_iso8601_duration("P14D"), Some(Duration::from_secs(14 * 86_400)));
        assert_eq!(parse_iso8601_duration("PT1M"), Some(Duration::from_secs(60)));
        assert_eq!(parse_iso8601_duration("PT30S"), Some(Duration::from_secs(30)));
        assert_eq!(
            parse_iso8601_duration("P1DT2H"),
            Some(Duration::from_secs(86_400 + 7_200))
        );
        assert_eq!(
            parse_iso8601_duration("PT0.5S"),
            Some(Duration::from_millis(500))
        );
    }

    #[test]
    fn parses_infinite_ttl() {
        let ttl = parse_iso8601_duration("P10675199DT2H48M5.4775807S").unwrap();
        assert!(ttl > Duration::from_secs(10_675_199 * 86_400));
    }

    #[test]
    fn rejects_garbage() {
        for input in ["", "P", "14D", "PT", "P1X", "PT5", "P1H"] {
            assert_eq!(parse_iso8601_duration(input), None, "input: {input}");
        }
    }

    #[test]
    fn maps_queue_resource_to_descriptor() {
        let json = r#"{
            "value": [{
                "name": "orders",
                "properties": {
                    "requiresSession": true,
                    "sizeInBytes": 2048,
                    "defaultMessageTimeToLive": "P14D",
                    "lockDuration": "PT1M",
                    "countDetails": {
                        "activeMessageCount": 7,
                        "deadLetterMessageCount": 2,
                        "scheduledMessageCount": 1
                    }
                }
            }],
            "nextLink": null
        }"#;
        let page: ListResponse<EntityResource> = serde_json::from_str(json).unwrap();
        let descriptor = page
            .value
            .into_iter()
            .next()
            .unwrap()
            .into_descriptor(EntityKind::Queue, None);

        assert_eq!(descriptor.name, "orders");
        assert!(descriptor.requires_session);
        assert_eq!(descriptor.active_count, 7);
        assert_eq!(descriptor.dead_letter_count, 2);
        assert_eq!(descriptor.scheduled_count, 1);
        assert_eq!(descriptor.size_bytes, 2048);
        assert_eq!(descriptor.lock_duration, Some(Duration::from_secs(60)));
    }

    #[test]
    fn subscription_descriptor_keeps_parent_topic() {
        let resource: EntityResource =
            serde_json::from_str(r#"{"name": "audit", "properties": {"messageCount": 4}}"#)
                .unwrap();
        let descriptor = resource.into_descriptor(EntityKind::Subscription, Some("events"));
        assert_eq!(descriptor.parent_topic.as_deref(), Some("events"));
        assert_eq!(descriptor.active_count, 4);
        assert_eq!(descriptor.address().path(), "events/Subscriptions/audit");
    }

    #[test]
    fn parses_namespace_resource_id() {
        let ns = NamespaceRef::from_resource_id(
            "/subscriptions/sub-1/resourceGroups/rg-1/providers/Microsoft.ServiceBus/namespaces/contoso",
        )
        .unwrap();
        assert_eq!(ns, NamespaceRef::new("sub-1", "rg-1", "contoso"));
        assert!(NamespaceRef::from_resource_id("/subscriptions/sub-1").is_err());
    }
}
