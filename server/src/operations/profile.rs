use super::{ClientPool, OperationOptions, PooledClient};
use crate::auth::ConnectionStringInfo;
use crate::common::{ServiceBusError, ServiceBusResult};
use crate::model::EntityKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a saved connection points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProfileKind {
    #[default]
    Namespace,
    Queue,
    Topic,
}

impl std::fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProfileKind::Namespace => write!(f, "namespace"),
            ProfileKind::Queue => write!(f, "queue"),
            ProfileKind::Topic => write!(f, "topic"),
        }
    }
}

/// A saved connection as persisted by the front end.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    pub connection_string: String,
    #[serde(default)]
    pub kind: ProfileKind,
    /// Queue or topic name for entity profiles
    #[serde(default)]
    pub entity_name: Option<String>,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for ConnectionProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionProfile")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("entity_name", &self.entity_name)
            .field("environment", &self.environment)
            .field("is_favorite", &self.is_favorite)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl ConnectionProfile {
    pub fn new(name: impl Into<String>, connection_string: impl Into<String>, kind: ProfileKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            connection_string: connection_string.into(),
            kind,
            entity_name: None,
            environment: String::new(),
            is_favorite: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_entity(mut self, entity_name: impl Into<String>) -> Self {
        self.entity_name = Some(entity_name.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Entity the profile targets: `entity_name`, else the connection
    /// string's `EntityPath`.
    pub fn target_entity(&self) -> ServiceBusResult<Option<String>> {
        let info = ConnectionStringInfo::parse(&self.connection_string)?;
        Ok(self.entity_name.clone().or(info.entity_path))
    }

    pub fn validate(&self) -> ServiceBusResult<()> {
        if self.name.trim().is_empty() {
            return Err(ServiceBusError::ConfigurationError(
                "Connection profile name cannot be empty".to_string(),
            ));
        }
        let target = self.target_entity()?;
        if self.kind != ProfileKind::Namespace && target.is_none() {
            return Err(ServiceBusError::ConfigurationError(format!(
                "Profile '{}' is a {} profile but names no entity",
                self.name, self.kind
            )));
        }
        Ok(())
    }

    /// Borrows a pooled connection for this profile.
    ///
    /// Entity profiles whose connection string is not already scoped get the
    /// entity appended as `EntityPath`.
    pub async fn open(
        &self,
        pool: &ClientPool,
        options: &OperationOptions,
    ) -> ServiceBusResult<PooledClient> {
        self.validate()?;
        let kind = match self.kind {
            ProfileKind::Topic => EntityKind::Topic,
            ProfileKind::Namespace | ProfileKind::Queue => EntityKind::Queue,
        };
        log::info!("Opening {} profile '{}'", self.kind, self.name);
        pool.connection_string(&self.scoped_connection_string()?, kind, options)
            .await
    }

    fn scoped_connection_string(&self) -> ServiceBusResult<String> {
        let info = ConnectionStringInfo::parse(&self.connection_string)?;
        let base = self.connection_string.trim().trim_end_matches(';');
        match (&self.kind, &self.entity_name, &info.entity_path) {
            (ProfileKind::Queue | ProfileKind::Topic, Some(entity), None) => {
                Ok(format!("{base};EntityPath={entity}"))
            }
            _ => Ok(base.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::operations::MessageTransport;
    use std::sync::Arc;

    const NAMESPACE: &str =
        "Endpoint=sb://demo.servicebus.windows.net/;SharedAccessKeyName=root;SharedAccessKey=abc=";

    #[test]
    fn profile_deserializes_with_defaults() {
        let json = format!(
            r#"{{"name":"dev","connection_string":"{NAMESPACE}","kind":"Queue","entity_name":"orders"}}"#
        );
        let profile: ConnectionProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(profile.kind, ProfileKind::Queue);
        assert!(!profile.is_favorite);
        assert!(profile.validate().is_ok());
    }

    #[test]
    fn entity_profile_without_entity_is_rejected() {
        let profile = ConnectionProfile::new("dev", NAMESPACE, ProfileKind::Topic);
        assert!(matches!(
            profile.validate(),
            Err(ServiceBusError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn queue_profile_opens_scoped_connection() {
        let broker = InMemoryBroker::new();
        broker.create_queue("orders", false);
        let pool = ClientPool::new().with_backend(Arc::new(broker));

        let profile = ConnectionProfile::new("dev", NAMESPACE, ProfileKind::Queue).with_entity("orders");
        let client = profile
            .open(&pool, &OperationOptions::default())
            .await
            .unwrap();

        let validation = client.validate_connection().await;
        assert_eq!(validation.resolved_entity.as_deref(), Some("orders"));
        assert_eq!(client.list_queues().await.unwrap().len(), 1);
    }
}
