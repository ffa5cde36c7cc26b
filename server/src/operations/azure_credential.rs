use super::directory::{EntityDirectory, ManagementDirectory};
use super::management::{ManagementClient, NamespaceRef};
use super::{OperationOptions, OperationsSource, ServiceBusOperations};
use crate::auth::{AuthProvider, ConnectionStringInfo};
use crate::broker::{AzureBroker, ServiceBusBackend};
use crate::common::ServiceBusResult;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Operations for a namespace reached through an Azure AD identity.
///
/// On first use the namespace connection string is fetched from Resource
/// Manager (`listKeys`) with a bearer token, and the client is built from it.
/// Listings always go through Resource Manager so they carry message counts.
pub struct AzureCredentialOperations {
    auth: Arc<dyn AuthProvider>,
    namespace: NamespaceRef,
    management: ManagementClient,
    options: OperationOptions,
    backend: Option<Arc<dyn ServiceBusBackend>>,
    directory: Option<Arc<dyn EntityDirectory>>,
    operations: OnceCell<ServiceBusOperations>,
}

impl std::fmt::Debug for AzureCredentialOperations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureCredentialOperations")
            .field("namespace", &self.namespace)
            .field("initialized", &self.operations.initialized())
            .finish_non_exhaustive()
    }
}

impl AzureCredentialOperations {
    pub fn new(
        auth: Arc<dyn AuthProvider>,
        namespace: NamespaceRef,
        options: OperationOptions,
    ) -> Self {
        Self {
            auth,
            namespace,
            management: ManagementClient::new(),
            options,
            backend: None,
            directory: None,
            operations: OnceCell::new(),
        }
    }

    pub fn with_management_client(mut self, management: ManagementClient) -> Self {
        self.management = management;
        self
    }

    /// Uses `backend` instead of resolving keys and connecting to Azure.
    pub fn with_backend(mut self, backend: Arc<dyn ServiceBusBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Uses `directory` instead of Resource Manager listings.
    pub fn with_directory(mut self, directory: Arc<dyn EntityDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn namespace(&self) -> &NamespaceRef {
        &self.namespace
    }

    pub fn is_initialized(&self) -> bool {
        self.operations.initialized()
    }

    async fn connect(&self) -> ServiceBusResult<Arc<dyn ServiceBusBackend>> {
        if let Some(backend) = &self.backend {
            return Ok(backend.clone());
        }

        let token = self.auth.authenticate().await?;
        let connection_string = self
            .management
            .get_namespace_connection_string(&token.token, &self.namespace)
            .await?;
        let info = ConnectionStringInfo::parse(&connection_string)?;
        log::info!(
            "Resolved connection string for namespace {}",
            self.namespace.namespace
        );

        Ok(Arc::new(
            AzureBroker::connect(&connection_string, info.endpoint()).await?,
        ))
    }

    async fn initialize(&self) -> ServiceBusResult<ServiceBusOperations> {
        let backend = self.connect().await?;
        let directory: Arc<dyn EntityDirectory> = match &self.directory {
            Some(directory) => directory.clone(),
            None => Arc::new(ManagementDirectory::new(
                self.management.clone(),
                self.auth.clone(),
                self.namespace.clone(),
            )),
        };
        Ok(ServiceBusOperations::new(
            backend,
            directory,
            self.options.clone(),
        ))
    }
}

#[async_trait]
impl OperationsSource for AzureCredentialOperations {
    async fn operations(&self) -> ServiceBusResult<&ServiceBusOperations> {
        self.operations
            .get_or_try_init(|| self.initialize())
            .await
            .inspect_err(|e| {
                log::error!(
                    "Failed to initialize client for namespace {}: {e}",
                    self.namespace.namespace
                )
            })
    }

    fn endpoint_hint(&self) -> Option<String> {
        Some(format!(
            "sb://{}.servicebus.windows.net/",
            self.namespace.namespace
        ))
    }

    async fn close(&self) -> ServiceBusResult<()> {
        match self.operations.get() {
            Some(operations) => operations.shutdown().await,
            None => Ok(()),
        }
    }
}
