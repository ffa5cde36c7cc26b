//! Entity listings from the namespace's own management endpoint
//! (`https://<namespace>/$Resources/...`), authorized with a shared access
//! signature instead of an Azure AD token.

use super::directory::EntityDirectory;
use super::management::{check_status, parse_iso8601_duration};
use crate::auth::{ConnectionStringInfo, SasTokenGenerator};
use crate::common::{ServiceBusError, ServiceBusResult};
use crate::model::{EntityDescriptor, EntityKind};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;

const API_VERSION: &str = "2021-05";
const PAGE_SIZE: usize = 100;
const TOKEN_VALIDITY_MINUTES: i64 = 60;

#[derive(Debug, Clone)]
enum Credential {
    Key(SasTokenGenerator),
    /// Pre-signed token taken verbatim from the connection string
    Signature(String),
}

/// Directory for namespace connection strings.
///
/// Queues, topics and subscriptions are read from Atom feeds served by the
/// namespace itself, so a connection string with Manage rights is enough; no
/// Azure AD principal is involved.
#[derive(Debug, Clone)]
pub struct SasDirectory {
    http_client: reqwest::Client,
    base_url: String,
    namespace: String,
    credential: Credential,
}

impl SasDirectory {
    /// Fails when the connection string carries neither a key nor a signature.
    pub fn from_connection_info(info: &ConnectionStringInfo) -> ServiceBusResult<Self> {
        let credential = match (
            &info.shared_access_key_name,
            &info.shared_access_key,
            &info.shared_access_signature,
        ) {
            (Some(key_name), Some(key), _) => Credential::Key(SasTokenGenerator::for_namespace(
                &info.fully_qualified_namespace,
                key_name.as_str(),
                key.as_str(),
            )),
            (_, _, Some(signature)) => Credential::Signature(signature.clone()),
            _ => {
                return Err(ServiceBusError::ConfigurationError(
                    "Listing entities needs a shared access key or signature".to_string(),
                ));
            }
        };

        Ok(Self {
            http_client: reqwest::Client::new(),
            base_url: format!("https://{}", info.fully_qualified_namespace),
            namespace: info.fully_qualified_namespace.clone(),
            credential,
        })
    }

    /// Sends requests to `base_url` instead of the namespace host (emulators, test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn authorization(&self) -> ServiceBusResult<String> {
        match &self.credential {
            Credential::Key(generator) => {
                generator.generate_sas_token(chrono::Duration::minutes(TOKEN_VALIDITY_MINUTES))
            }
            Credential::Signature(signature) => Ok(signature.clone()),
        }
    }

    async fn get(
        &self,
        path: &str,
        query: &str,
        operation: &str,
        entity: &str,
    ) -> ServiceBusResult<String> {
        let url = format!("{}/{}?api-version={API_VERSION}{query}", self.base_url, path);
        log::debug!("GET {url}");

        let response = self
            .http_client
            .get(&url)
            .header(AUTHORIZATION, self.authorization()?)
            .send()
            .await
            .map_err(|e| ServiceBusError::transport(operation, entity, e))?;

        let response = check_status(response, operation, entity).await?;
        response
            .text()
            .await
            .map_err(|e| ServiceBusError::transport(operation, entity, format!("bad response: {e}")))
    }

    async fn list_feed(
        &self,
        path: &str,
        kind: EntityKind,
        parent_topic: Option<&str>,
        operation: &str,
    ) -> ServiceBusResult<Vec<EntityDescriptor>> {
        let entity = parent_topic.unwrap_or(self.namespace.as_str());
        let mut descriptors = Vec::new();
        let mut skip = 0;

        loop {
            let query = format!("&$skip={skip}&$top={PAGE_SIZE}");
            let feed = self.get(path, &query, operation, entity).await?;
            let entries: Vec<&str> = feed_entries(&feed).collect();
            skip += entries.len();
            descriptors.extend(
                entries
                    .iter()
                    .filter_map(|entry| entry_descriptor(entry, kind, parent_topic)),
            );
            if entries.len() < PAGE_SIZE {
                return Ok(descriptors);
            }
        }
    }
}

#[async_trait]
impl EntityDirectory for SasDirectory {
    async fn list_queues(&self) -> ServiceBusResult<Vec<EntityDescriptor>> {
        self.list_feed("$Resources/Queues", EntityKind::Queue, None, "list queues")
            .await
    }

    async fn list_topics(&self) -> ServiceBusResult<Vec<EntityDescriptor>> {
        self.list_feed("$Resources/Topics", EntityKind::Topic, None, "list topics")
            .await
    }

    async fn list_subscriptions(&self, topic: &str) -> ServiceBusResult<Vec<EntityDescriptor>> {
        // A missing entity comes back as an empty feed rather than a 404
        let description = self.get(topic, "", "get topic", topic).await?;
        if !is_entry_document(&description) {
            return Err(ServiceBusError::EntityNotFound(topic.to_string()));
        }

        self.list_feed(
            &format!("{topic}/Subscriptions"),
            EntityKind::Subscription,
            Some(topic),
            "list subscriptions",
        )
        .await
    }
}

/// `<entry>` bodies of an Atom feed, in document order.
fn feed_entries(feed: &str) -> impl Iterator<Item = &str> {
    let mut rest = feed;
    std::iter::from_fn(move || {
        let start = find_tag(rest, "entry")?;
        let body = &rest[start..];
        let end = body.find("</entry>").map_or(body.len(), |end| end + "</entry>".len());
        rest = &body[end..];
        Some(&body[..end])
    })
}

/// Whether the document's root element is a single `<entry>`.
fn is_entry_document(document: &str) -> bool {
    match (find_tag(document, "entry"), find_tag(document, "feed")) {
        (Some(_), None) => true,
        (Some(entry), Some(feed)) => entry < feed,
        (None, _) => false,
    }
}

fn entry_descriptor(
    entry: &str,
    kind: EntityKind,
    parent_topic: Option<&str>,
) -> Option<EntityDescriptor> {
    let name = element_text(entry, "title")?;
    if name.is_empty() {
        return None;
    }

    let count = |element: &str| {
        element_text(entry, element)
            .and_then(|text| text.parse::<i64>().ok())
            .unwrap_or(0)
    };
    let active = match count("ActiveMessageCount") {
        // Subscriptions on older namespaces only report the aggregate
        0 => count("MessageCount"),
        active => active,
    };

    Some(EntityDescriptor {
        name,
        kind,
        parent_topic: parent_topic.map(str::to_string),
        requires_session: element_text(entry, "RequiresSession")
            .is_some_and(|text| text.eq_ignore_ascii_case("true")),
        active_count: active,
        dead_letter_count: count("DeadLetterMessageCount"),
        scheduled_count: count("ScheduledMessageCount"),
        size_bytes: count("SizeInBytes"),
        default_ttl: element_text(entry, "DefaultMessageTimeToLive")
            .as_deref()
            .and_then(parse_iso8601_duration),
        lock_duration: element_text(entry, "LockDuration")
            .as_deref()
            .and_then(parse_iso8601_duration),
    })
}

/// Byte offset of the first opening tag whose local name is `name`, ignoring
/// any namespace prefix.
fn find_tag(xml: &str, name: &str) -> Option<usize> {
    let mut offset = 0;
    while let Some(found) = xml[offset..].find('<') {
        let start = offset + found;
        let tag = &xml[start + 1..];
        let tag_name = tag
            .split(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .next()
            .unwrap_or_default();
        let local = tag_name.rsplit(':').next().unwrap_or(tag_name);
        if !tag.starts_with('/') && !tag.starts_with('?') && local == name {
            return Some(start);
        }
        offset = start + 1;
    }
    None
}

/// Unescaped text of the first `name` element, or `None` when absent.
fn element_text(xml: &str, name: &str) -> Option<String> {
    let start = find_tag(xml, name)?;
    let open_end = start + xml[start..].find('>')?;
    if xml[..open_end].ends_with('/') {
        return Some(String::new());
    }
    let content = &xml[open_end + 1..];
    let end = content.find('<').unwrap_or(content.len());
    Some(unescape(content[..end].trim()))
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const QUEUES: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title type="text">Queues</title>
  <entry>
    <id>https://demo.servicebus.windows.net/orders</id>
    <title type="text">orders</title>
    <content type="application/xml">
      <QueueDescription xmlns="http://schemas.microsoft.com/netservices/2010/10/servicebus/connect" xmlns:i="http://www.w3.org/2001/XMLSchema-instance">
        <LockDuration>PT1M</LockDuration>
        <RequiresSession>true</RequiresSession>
        <DefaultMessageTimeToLive>P14D</DefaultMessageTimeToLive>
        <SizeInBytes>2048</SizeInBytes>
        <MessageCount>10</MessageCount>
        <CountDetails xmlns:d2p1="http://schemas.microsoft.com/netservices/2011/06/servicebus">
          <d2p1:ActiveMessageCount>7</d2p1:ActiveMessageCount>
          <d2p1:DeadLetterMessageCount>2</d2p1:DeadLetterMessageCount>
          <d2p1:ScheduledMessageCount>1</d2p1:ScheduledMessageCount>
        </CountDetails>
      </QueueDescription>
    </content>
  </entry>
  <entry>
    <title type="text">billing &amp; invoices</title>
    <content type="application/xml">
      <QueueDescription>
        <RequiresSession>false</RequiresSession>
        <MessageCount>3</MessageCount>
      </QueueDescription>
    </content>
  </entry>
</feed>"#;

    #[test]
    fn maps_feed_entries_to_descriptors() {
        let descriptors: Vec<EntityDescriptor> = feed_entries(QUEUES)
            .filter_map(|entry| entry_descriptor(entry, EntityKind::Queue, None))
            .collect();

        assert_eq!(descriptors.len(), 2);
        let orders = &descriptors[0];
        assert_eq!(orders.name, "orders");
        assert!(orders.requires_session);
        assert_eq!(orders.active_count, 7);
        assert_eq!(orders.dead_letter_count, 2);
        assert_eq!(orders.scheduled_count, 1);
        assert_eq!(orders.size_bytes, 2048);
        assert_eq!(orders.lock_duration, Some(Duration::from_secs(60)));
        assert_eq!(orders.default_ttl, Some(Duration::from_secs(14 * 86_400)));

        let billing = &descriptors[1];
        assert_eq!(billing.name, "billing & invoices");
        assert!(!billing.requires_session);
        assert_eq!(billing.active_count, 3);
    }

    #[test]
    fn empty_feed_has_no_entries() {
        let feed = r#"<feed xmlns="http://www.w3.org/2005/Atom"><title type="text">Queues</title></feed>"#;
        assert_eq!(feed_entries(feed).count(), 0);
        assert!(!is_entry_document(feed));
    }

    #[test]
    fn single_entity_document_is_an_entry() {
        let document = r#"<?xml version="1.0"?><entry xmlns="http://www.w3.org/2005/Atom"><title type="text">events</title></entry>"#;
        assert!(is_entry_document(document));
        assert_eq!(element_text(document, "title").as_deref(), Some("events"));
    }

    #[test]
    fn prefixed_and_self_closing_elements() {
        let xml = "<a><d2p1:ActiveMessageCount>5</d2p1:ActiveMessageCount><ForwardTo/></a>";
        assert_eq!(element_text(xml, "ActiveMessageCount").as_deref(), Some("5"));
        assert_eq!(element_text(xml, "ForwardTo").as_deref(), Some(""));
        assert_eq!(element_text(xml, "Missing"), None);
    }

    #[test]
    fn signature_only_strings_reuse_their_signature() {
        let info = ConnectionStringInfo::parse(
            "Endpoint=sb://demo.servicebus.windows.net/;SharedAccessSignature=SharedAccessSignature sr=x&sig=y&se=1&skn=root",
        )
        .unwrap();
        let directory = SasDirectory::from_connection_info(&info).unwrap();
        assert_eq!(
            directory.authorization().unwrap(),
            "SharedAccessSignature sr=x&sig=y&se=1&skn=root"
        );
    }

    #[test]
    fn key_strings_sign_for_the_namespace() {
        let info = ConnectionStringInfo::parse(
            "Endpoint=sb://demo.servicebus.windows.net/;SharedAccessKeyName=root;SharedAccessKey=abc=",
        )
        .unwrap();
        let directory = SasDirectory::from_connection_info(&info).unwrap();
        let token = directory.authorization().unwrap();
        assert!(token.starts_with(
            "SharedAccessSignature sr=https%3A%2F%2Fdemo.servicebus.windows.net%2F&sig="
        ));
        assert!(token.ends_with("&skn=root"));
    }
}
