use crate::error::CoreError;
use crate::memory::MemoryRepository;
use crate::postgres::PgRepository;
use crate::repository::ProjectRepository;
use std::sync::Arc;
use tracing::info;

/// Repository backend configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StorageConfig {
    /// Keep all state in process memory. Lost on exit.
    #[default]
    Memory,
    /// Read and write the owning PostgreSQL database.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }

    /// Open the configured repository. Postgres schemas are ensured before returning.
    pub async fn bootstrap(&self) -> Result<Arc<dyn ProjectRepository>, CoreError> {
        match self {
            Self::Memory => Ok(Arc::new(MemoryRepository::new())),
            Self::Postgres {
                database_url,
                max_connections,
            } => {
                let repo = PgRepository::connect(database_url, *max_connections).await?;
                repo.ensure_schema().await?;
                info!(max_connections = *max_connections, "postgres repository ready");
                Ok(Arc::new(repo))
            }
        }
    }
}
