// Label stores: where classification results are recorded against file records

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use tokio_postgres::{Client, NoTls};
use tracing::{error, info, instrument};

use crate::core::config::PersistenceConfig;
use crate::core::errors::PersistenceError;

#[async_trait]
pub trait LabelStore: Send + Sync {
    /// Record a result for the existing file record named `file_name`.
    ///
    /// Fails with `RecordNotFound` (nothing written) when no such record exists.
    async fn save(
        &self,
        file_name: &str,
        major_category: Option<&str>,
        leaf_category: Option<&str>,
    ) -> Result<(), PersistenceError>;
}

/// PostgreSQL-backed label store
pub struct PostgresLabelStore {
    client: Client,
}

impl PostgresLabelStore {
    pub async fn connect(config: &PersistenceConfig) -> Result<Self, PersistenceError> {
        let (client, connection) = config.pg_config().connect(NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        info!("Connected to PostgreSQL at {}:{}", config.host, config.port);
        Ok(Self { client })
    }
}

#[async_trait]
impl LabelStore for PostgresLabelStore {
    #[instrument(skip(self))]
    async fn save(
        &self,
        file_name: &str,
        major_category: Option<&str>,
        leaf_category: Option<&str>,
    ) -> Result<(), PersistenceError> {
        let record = self
            .client
            .query_opt(
                "SELECT id::bigint FROM upload_filerecord WHERE file_name = $1 LIMIT 1",
                &[&file_name],
            )
            .await?;

        let Some(row) = record else {
            return Err(PersistenceError::RecordNotFound(file_name.to_string()));
        };
        let file_record_id: i64 = row.try_get(0)?;

        self.client
            .execute(
                "INSERT INTO upload_labellingresult \
                 (file_record_id, category_label, leaf_label, processed_at) \
                 VALUES ($1::bigint, $2, $3, NOW())",
                &[&file_record_id, &major_category, &leaf_category],
            )
            .await?;

        info!("Saved labels for {} (record {})", file_name, file_record_id);
        Ok(())
    }
}

/// One stored result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelRecord {
    pub file_name: String,
    pub major_category: Option<String>,
    pub leaf_category: Option<String>,
}

/// In-process label store with a fixed set of known file records
#[derive(Default)]
pub struct InMemoryLabelStore {
    file_records: RwLock<HashSet<String>>,
    results: RwLock<Vec<LabelRecord>>,
}

impl InMemoryLabelStore {
    pub fn with_records<I, S>(file_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            file_records: RwLock::new(file_names.into_iter().map(Into::into).collect()),
            results: RwLock::new(Vec::new()),
        }
    }

    pub fn add_record(&self, file_name: impl Into<String>) {
        self.file_records.write().insert(file_name.into());
    }

    pub fn results(&self) -> Vec<LabelRecord> {
        self.results.read().clone()
    }
}

#[async_trait]
impl LabelStore for InMemoryLabelStore {
    async fn save(
        &self,
        file_name: &str,
        major_category: Option<&str>,
        leaf_category: Option<&str>,
    ) -> Result<(), PersistenceError> {
        if !self.file_records.read().contains(file_name) {
            return Err(PersistenceError::RecordNotFound(file_name.to_string()));
        }
        self.results.write().push(LabelRecord {
            file_name: file_name.to_string(),
            major_category: major_category.map(str::to_string),
            leaf_category: leaf_category.map(str::to_string),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_record_writes_nothing() {
        let store = InMemoryLabelStore::with_records(["p1.png"]);
        let result = store.save("p2.png", Some("도형과 측정"), None).await;
        assert!(matches!(result, Err(PersistenceError::RecordNotFound(name)) if name == "p2.png"));
        assert!(store.results().is_empty());
    }

    #[tokio::test]
    async fn test_known_record_saved() {
        let store = InMemoryLabelStore::default();
        store.add_record("p1.png");
        store
            .save("p1.png", Some("도형과 측정"), Some("도형의 넓이"))
            .await
            .unwrap();
        assert_eq!(
            store.results(),
            vec![LabelRecord {
                file_name: "p1.png".to_string(),
                major_category: Some("도형과 측정".to_string()),
                leaf_category: Some("도형의 넓이".to_string()),
            }]
        );
    }
}
