//! 테이블 스키마 메타데이터와 캐시
//!
//! `(database, table)` 을 컬럼 목록, 컬럼 의미 타입, 기본 키 컬럼 인덱스로 해석합니다.
//! 한 번 조회한 메타데이터는 프로세스 수명 동안 캐시됩니다.

use crate::error::{CdcError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// 컬럼 의미 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Number,
    Float,
    String,
    Other,
}

impl ColumnType {
    /// `INFORMATION_SCHEMA.COLUMNS.DATA_TYPE` 값을 의미 타입으로 변환
    pub fn from_data_type(data_type: &str) -> Self {
        match data_type.to_ascii_lowercase().as_str() {
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "year" => {
                ColumnType::Number
            }
            "float" | "double" | "real" | "decimal" | "numeric" => ColumnType::Float,
            "char" | "varchar" | "tinytext" | "text" | "mediumtext" | "longtext" | "json" => {
                ColumnType::String
            }
            _ => ColumnType::Other,
        }
    }
}

/// 테이블 컬럼
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
    pub column_type: ColumnType,
}

impl TableColumn {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        TableColumn {
            name: name.into(),
            column_type,
        }
    }
}

/// 테이블 메타데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub database: String,
    pub name: String,
    pub columns: Vec<TableColumn>,
    /// 기본 키 컬럼 인덱스 (키 순서). 비어 있으면 사용 가능한 PK가 없는 상태
    pub pk_columns: Vec<usize>,
}

impl TableMetadata {
    pub fn new(
        database: impl Into<String>,
        name: impl Into<String>,
        columns: Vec<TableColumn>,
        pk_columns: Vec<usize>,
    ) -> Self {
        TableMetadata {
            database: database.into(),
            name: name.into(),
            columns,
            pk_columns,
        }
    }
}

impl fmt::Display for TableMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.name)
    }
}

/// 스키마 조회 협력자
///
/// 테이블이 없으면 `CdcError::TableNotFound`, 연결 실패는 연결 계열 에러를 반환해야 합니다.
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn fetch_table(&self, database: &str, table: &str) -> Result<TableMetadata>;
}

/// 지연 로딩 테이블 메타데이터 캐시
pub struct SchemaCache {
    provider: Arc<dyn SchemaProvider>,
    tables: RwLock<HashMap<String, Arc<TableMetadata>>>,
}

impl SchemaCache {
    pub fn new(provider: Arc<dyn SchemaProvider>) -> Self {
        SchemaCache {
            provider,
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// 캐시된 메타데이터를 반환하고, 없으면 조회 후 캐시
    pub async fn get_table(&self, database: &str, table: &str) -> Result<Arc<TableMetadata>> {
        let key = format!("{}.{}", database, table);
        let cached = self.tables.read().get(&key).cloned();
        if let Some(meta) = cached {
            return Ok(meta);
        }

        let meta = self.provider.fetch_table(database, table).await?;
        if meta.columns.is_empty() {
            return Err(CdcError::TableNotFound(key));
        }
        debug!(
            "Loaded metadata for {}: {} columns, pk {:?}",
            key,
            meta.columns.len(),
            meta.pk_columns
        );

        // 동시에 조회된 경우 먼저 들어간 항목을 유지
        let mut tables = self.tables.write();
        let entry = tables.entry(key).or_insert_with(|| Arc::new(meta));
        Ok(Arc::clone(entry))
    }

    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SchemaProvider for CountingProvider {
        async fn fetch_table(&self, database: &str, table: &str) -> Result<TableMetadata> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if table == "missing" {
                return Err(CdcError::TableNotFound(format!("{}.{}", database, table)));
            }
            Ok(TableMetadata::new(
                database,
                table,
                vec![
                    TableColumn::new("id", ColumnType::Number),
                    TableColumn::new("name", ColumnType::String),
                ],
                vec![0],
            ))
        }
    }

    #[test]
    fn test_column_type_mapping() {
        assert_eq!(ColumnType::from_data_type("BIGINT"), ColumnType::Number);
        assert_eq!(ColumnType::from_data_type("decimal"), ColumnType::Float);
        assert_eq!(ColumnType::from_data_type("varchar"), ColumnType::String);
        assert_eq!(ColumnType::from_data_type("datetime"), ColumnType::Other);
        assert_eq!(ColumnType::from_data_type("enum"), ColumnType::Other);
    }

    #[tokio::test]
    async fn test_cache_fetches_once() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let cache = SchemaCache::new(provider.clone());

        let first = cache.get_table("shop", "orders").await.unwrap();
        let second = cache.get_table("shop", "orders").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(first.to_string(), "shop.orders");
    }

    #[tokio::test]
    async fn test_cache_propagates_not_found() {
        let cache = SchemaCache::new(Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        }));

        let err = cache.get_table("shop", "missing").await.unwrap_err();
        assert!(matches!(err, CdcError::TableNotFound(_)));
        assert!(cache.is_empty());
    }
}
