use super::management::{ManagementClient, NamespaceRef};
use crate::auth::AuthProvider;
use crate::common::{ServiceBusError, ServiceBusResult};
use crate::model::{EntityDescriptor, EntityKind};
use async_trait::async_trait;
use std::sync::Arc;

/// Source of entity listings with message counts.
///
/// Listing an empty namespace yields an empty list, never an error.
#[async_trait]
pub trait EntityDirectory: Send + Sync {
    async fn list_queues(&self) -> ServiceBusResult<Vec<EntityDescriptor>>;

    async fn list_topics(&self) -> ServiceBusResult<Vec<EntityDescriptor>>;

    /// Fails with [`ServiceBusError::EntityNotFound`] when the topic does not exist.
    async fn list_subscriptions(&self, topic: &str) -> ServiceBusResult<Vec<EntityDescriptor>>;
}

/// Directory backed by Azure Resource Manager, authenticated with a bearer token.
pub struct ManagementDirectory {
    client: ManagementClient,
    auth: Arc<dyn AuthProvider>,
    namespace: NamespaceRef,
}

impl ManagementDirectory {
    pub fn new(
        client: ManagementClient,
        auth: Arc<dyn AuthProvider>,
        namespace: NamespaceRef,
    ) -> Self {
        Self {
            client,
            auth,
            namespace,
        }
    }

    async fn token(&self) -> ServiceBusResult<String> {
        Ok(self.auth.authenticate().await?.token)
    }
}

#[async_trait]
impl EntityDirectory for ManagementDirectory {
    async fn list_queues(&self) -> ServiceBusResult<Vec<EntityDescriptor>> {
        let token = self.token().await?;
        self.client.list_queues(&token, &self.namespace).await
    }

    async fn list_topics(&self) -> ServiceBusResult<Vec<EntityDescriptor>> {
        let token = self.token().await?;
        self.client.list_topics(&token, &self.namespace).await
    }

    async fn list_subscriptions(&self, topic: &str) -> ServiceBusResult<Vec<EntityDescriptor>> {
        let token = self.token().await?;
        self.client
            .list_subscriptions(&token, &self.namespace, topic)
            .await
    }
}

/// Directory for a connection string scoped to a single queue or topic.
///
/// Such a connection string grants no management rights, so the only entity
/// that can be reported is the one it is scoped to, without counts.
#[derive(Debug, Clone)]
pub struct ScopedDirectory {
    entity: String,
    kind: EntityKind,
}

impl ScopedDirectory {
    pub fn new(entity: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            entity: entity.into(),
            kind,
        }
    }

    fn only(&self, kind: EntityKind) -> Vec<EntityDescriptor> {
        if self.kind == kind {
            vec![EntityDescriptor::named(self.entity.clone(), kind)]
        } else {
            Vec::new()
        }
    }
}

#[async_trait]
impl EntityDirectory for ScopedDirectory {
    async fn list_queues(&self) -> ServiceBusResult<Vec<EntityDescriptor>> {
        Ok(self.only(EntityKind::Queue))
    }

    async fn list_topics(&self) -> ServiceBusResult<Vec<EntityDescriptor>> {
        Ok(self.only(EntityKind::Topic))
    }

    async fn list_subscriptions(&self, topic: &str) -> ServiceBusResult<Vec<EntityDescriptor>> {
        if self.kind != EntityKind::Topic || topic != self.entity {
            return Err(ServiceBusError::EntityNotFound(topic.to_string()));
        }
        Err(ServiceBusError::ConfigurationError(format!(
            "Listing subscriptions of '{topic}' needs a namespace connection string or credentials"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scoped_directory_reports_only_its_entity() {
        let directory = ScopedDirectory::new("orders", EntityKind::Queue);
        let queues = directory.list_queues().await.unwrap();
        assert_eq!(queues.len(), 1);
        assert_eq!(queues[0].name, "orders");
        assert!(directory.list_topics().await.unwrap().is_empty());
        assert!(
            directory
                .list_subscriptions("events")
                .await
                .unwrap_err()
                .is_not_found()
        );
    }
}
