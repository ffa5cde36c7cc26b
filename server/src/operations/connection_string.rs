use super::directory::{EntityDirectory, ScopedDirectory};
use super::sas_directory::SasDirectory;
use super::{OperationOptions, OperationsSource, ServiceBusOperations};
use crate::auth::ConnectionStringInfo;
use crate::broker::{AzureBroker, ServiceBusBackend};
use crate::common::ServiceBusResult;
use crate::model::EntityKind;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Operations over a shared-access connection string.
///
/// The string is parsed eagerly so malformed input fails at construction. The
/// client is created on first use; concurrent first calls share a single
/// initialization.
///
/// A connection string scoped to one entity (`EntityPath=`) lists just that
/// entity. A namespace connection string lists through the namespace's
/// management endpoint with a [`SasDirectory`], unless another
/// [`EntityDirectory`] is injected with [`with_directory`](Self::with_directory).
pub struct ConnectionStringOperations {
    connection_string: String,
    info: ConnectionStringInfo,
    options: OperationOptions,
    entity_kind: EntityKind,
    backend: Option<Arc<dyn ServiceBusBackend>>,
    directory: Option<Arc<dyn EntityDirectory>>,
    operations: OnceCell<ServiceBusOperations>,
}

impl std::fmt::Debug for ConnectionStringOperations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStringOperations")
            .field("info", &self.info)
            .field("initialized", &self.operations.initialized())
            .finish_non_exhaustive()
    }
}

impl ConnectionStringOperations {
    pub fn new(connection_string: &str, options: OperationOptions) -> ServiceBusResult<Self> {
        let info = ConnectionStringInfo::parse(connection_string)?;
        Ok(Self {
            connection_string: connection_string.trim().to_string(),
            info,
            options,
            entity_kind: EntityKind::Queue,
            backend: None,
            directory: None,
            operations: OnceCell::new(),
        })
    }

    /// Uses `backend` instead of connecting to Azure.
    pub fn with_backend(mut self, backend: Arc<dyn ServiceBusBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn EntityDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Kind of the entity named by `EntityPath`; queues are assumed otherwise.
    pub fn with_entity_kind(mut self, kind: EntityKind) -> Self {
        self.entity_kind = kind;
        self
    }

    pub fn info(&self) -> &ConnectionStringInfo {
        &self.info
    }

    pub fn is_initialized(&self) -> bool {
        self.operations.initialized()
    }

    async fn initialize(&self) -> ServiceBusResult<ServiceBusOperations> {
        let endpoint = self.info.endpoint();
        log::info!("Initializing Service Bus client for {endpoint}");

        let backend: Arc<dyn ServiceBusBackend> = match &self.backend {
            Some(backend) => backend.clone(),
            None => Arc::new(AzureBroker::connect(&self.connection_string, endpoint).await?),
        };

        let directory: Arc<dyn EntityDirectory> = match (&self.directory, &self.info.entity_path) {
            (Some(directory), _) => directory.clone(),
            (None, Some(entity)) => Arc::new(ScopedDirectory::new(entity.clone(), self.entity_kind)),
            (None, None) => Arc::new(SasDirectory::from_connection_info(&self.info)?),
        };

        Ok(
            ServiceBusOperations::new(backend, directory, self.options.clone())
                .with_scoped_entity(self.info.entity_path.clone()),
        )
    }
}

#[async_trait]
impl OperationsSource for ConnectionStringOperations {
    async fn operations(&self) -> ServiceBusResult<&ServiceBusOperations> {
        self.operations
            .get_or_try_init(|| self.initialize())
            .await
            .inspect_err(|e| log::error!("Failed to initialize Service Bus client: {e}"))
    }

    fn endpoint_hint(&self) -> Option<String> {
        Some(self.info.endpoint())
    }

    async fn close(&self) -> ServiceBusResult<()> {
        match self.operations.get() {
            Some(operations) => operations.shutdown().await,
            None => Ok(()),
        }
    }
}
