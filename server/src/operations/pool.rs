use super::{
    AzureCredentialOperations, ConnectionStringOperations, NamespaceRef, OperationOptions,
    OperationsSource, ServiceBusOperations,
};
use crate::auth::AuthProvider;
use crate::broker::ServiceBusBackend;
use crate::common::{ServiceBusResult, acquire_lock_with_timeout};
use crate::model::EntityKind;
use async_trait::async_trait;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const POOL_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

struct PoolEntry {
    source: Arc<dyn OperationsSource>,
    leases: Arc<AtomicUsize>,
    last_used: Instant,
}

/// Shares connections between callers, keyed by connection string or
/// namespace identity.
///
/// Callers borrow a [`PooledClient`] and drop it when done; they never close
/// the connection themselves. Idle connections are closed by
/// [`evict_idle`](Self::evict_idle) and everything by [`shutdown`](Self::shutdown).
pub struct ClientPool {
    entries: Mutex<HashMap<String, PoolEntry>>,
    backend: Option<Arc<dyn ServiceBusBackend>>,
}

impl Default for ClientPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientPool {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            backend: None,
        }
    }

    /// Every connection created by this pool uses `backend` instead of Azure.
    pub fn with_backend(mut self, backend: Arc<dyn ServiceBusBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Borrows the connection for `connection_string`, creating it on first use.
    pub async fn connection_string(
        &self,
        connection_string: &str,
        kind: EntityKind,
        options: &OperationOptions,
    ) -> ServiceBusResult<PooledClient> {
        let key = format!("sas:{}", connection_string.trim());
        self.get_or_insert(key, || {
            let mut operations =
                ConnectionStringOperations::new(connection_string, options.clone())?
                    .with_entity_kind(kind);
            if let Some(backend) = &self.backend {
                operations = operations.with_backend(backend.clone());
            }
            let source: Arc<dyn OperationsSource> = Arc::new(operations);
            Ok(source)
        })
        .await
    }

    /// Borrows the connection for a namespace reached with Azure AD credentials.
    pub async fn azure_credential(
        &self,
        auth: Arc<dyn AuthProvider>,
        namespace: &NamespaceRef,
        options: &OperationOptions,
    ) -> ServiceBusResult<PooledClient> {
        let key = format!(
            "aad:{}/{}/{}",
            namespace.subscription_id, namespace.resource_group, namespace.namespace
        );
        self.get_or_insert(key, || {
            let mut operations =
                AzureCredentialOperations::new(auth, namespace.clone(), options.clone());
            if let Some(backend) = &self.backend {
                operations = operations.with_backend(backend.clone());
            }
            let source: Arc<dyn OperationsSource> = Arc::new(operations);
            Ok(source)
        })
        .await
    }

    /// Borrows the connection stored under `key`, inserting the one `create`
    /// builds when there is none.
    pub async fn get_or_insert<F>(&self, key: String, create: F) -> ServiceBusResult<PooledClient>
    where
        F: FnOnce() -> ServiceBusResult<Arc<dyn OperationsSource>>,
    {
        let mut entries =
            acquire_lock_with_timeout(&self.entries, "client pool", POOL_LOCK_TIMEOUT, None)
                .await?;

        let pooled = entries.len();
        let entry = match entries.entry(key) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                log::debug!("Creating pooled connection ({} pooled)", pooled + 1);
                vacant.insert(PoolEntry {
                    source: create()?,
                    leases: Arc::new(AtomicUsize::new(0)),
                    last_used: Instant::now(),
                })
            }
        };
        entry.last_used = Instant::now();
        Ok(PooledClient::new(entry.source.clone(), entry.leases.clone()))
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Closes and removes connections nobody borrows that were last handed
    /// out at least `idle_for` ago. Returns how many were removed.
    pub async fn evict_idle(&self, idle_for: Duration) -> ServiceBusResult<usize> {
        let evicted: Vec<PoolEntry> = {
            let mut entries =
                acquire_lock_with_timeout(&self.entries, "client pool", POOL_LOCK_TIMEOUT, None)
                    .await?;
            let idle: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| {
                    entry.leases.load(Ordering::Acquire) == 0
                        && entry.last_used.elapsed() >= idle_for
                })
                .map(|(key, _)| key.clone())
                .collect();
            idle.iter().filter_map(|key| entries.remove(key)).collect()
        };

        let count = evicted.len();
        for entry in evicted {
            if let Err(e) = entry.source.close().await {
                log::warn!("Failed to close idle pooled connection: {e}");
            }
        }
        if count > 0 {
            log::info!("Evicted {count} idle pooled connections");
        }
        Ok(count)
    }

    /// Closes every connection, borrowed or not, and empties the pool.
    pub async fn shutdown(&self) {
        let drained: Vec<PoolEntry> = self.entries.lock().await.drain().map(|(_, e)| e).collect();
        for entry in drained {
            let leases = entry.leases.load(Ordering::Acquire);
            if leases > 0 {
                log::warn!("Closing pooled connection with {leases} active leases");
            }
            if let Err(e) = entry.source.close().await {
                log::warn!("Failed to close pooled connection: {e}");
            }
        }
        log::info!("Client pool shut down");
    }
}

/// A borrowed pooled connection.
///
/// Cloning takes another lease; dropping returns it. A `PooledClient` is a
/// full [`MessageTransport`](super::MessageTransport).
pub struct PooledClient {
    source: Arc<dyn OperationsSource>,
    leases: Arc<AtomicUsize>,
}

impl PooledClient {
    fn new(source: Arc<dyn OperationsSource>, leases: Arc<AtomicUsize>) -> Self {
        leases.fetch_add(1, Ordering::AcqRel);
        Self { source, leases }
    }

    /// Leases currently held on this connection, this one included.
    pub fn lease_count(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }
}

impl Clone for PooledClient {
    fn clone(&self) -> Self {
        Self::new(self.source.clone(), self.leases.clone())
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        self.leases.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledClient")
            .field("endpoint", &self.source.endpoint_hint())
            .field("leases", &self.lease_count())
            .finish()
    }
}

#[async_trait]
impl OperationsSource for PooledClient {
    async fn operations(&self) -> ServiceBusResult<&ServiceBusOperations> {
        self.source.operations().await
    }

    fn endpoint_hint(&self) -> Option<String> {
        self.source.endpoint_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::operations::MessageTransport;

    const CONNECTION: &str =
        "Endpoint=sb://demo.servicebus.windows.net/;SharedAccessKeyName=root;SharedAccessKey=abc=;EntityPath=orders";

    fn pool() -> ClientPool {
        let broker = InMemoryBroker::new();
        broker.create_queue("orders", false);
        ClientPool::new().with_backend(Arc::new(broker))
    }

    #[tokio::test]
    async fn same_connection_string_shares_one_connection() {
        let pool = pool();
        let options = OperationOptions::default();

        let a = pool
            .connection_string(CONNECTION, EntityKind::Queue, &options)
            .await
            .unwrap();
        let b = pool
            .connection_string(CONNECTION, EntityKind::Queue, &options)
            .await
            .unwrap();

        assert_eq!(pool.len().await, 1);
        assert_eq!(a.lease_count(), 2);
        assert!(std::ptr::eq(
            a.operations().await.unwrap(),
            b.operations().await.unwrap()
        ));
        drop(b);
        assert_eq!(a.lease_count(), 1);
    }

    #[tokio::test]
    async fn borrowed_connections_are_not_evicted() {
        let pool = pool();
        let options = OperationOptions::default();
        let lease = pool
            .connection_string(CONNECTION, EntityKind::Queue, &options)
            .await
            .unwrap();
        assert!(lease.validate_connection().await.valid);

        assert_eq!(pool.evict_idle(Duration::ZERO).await.unwrap(), 0);
        drop(lease);
        assert_eq!(pool.evict_idle(Duration::ZERO).await.unwrap(), 1);
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn invalid_connection_string_is_not_pooled() {
        let pool = pool();
        let result = pool
            .connection_string("Endpoint=", EntityKind::Queue, &OperationOptions::default())
            .await;
        assert!(result.is_err());
        assert!(pool.is_empty().await);
    }
}
