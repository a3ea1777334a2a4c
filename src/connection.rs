//! MySQL 데이터베이스 연결 관리 및 스키마 조회

use crate::error::{CdcError, Result};
use crate::offset::BinlogPosition;
use crate::schema::{ColumnType, SchemaProvider, TableColumn, TableMetadata};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Pool, Row};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// 데이터베이스 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    #[default]
    Mysql,
    Mariadb,
}

impl std::str::FromStr for Flavor {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" => Ok(Flavor::Mysql),
            "mariadb" => Ok(Flavor::Mariadb),
            other => Err(CdcError::Config(format!("unknown flavor {}", other))),
        }
    }
}

/// MySQL 연결 설정
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    /// 복제 슬레이브로 접속할 때 사용할 서버 ID
    pub server_id: u32,
    pub flavor: Flavor,
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: None,
            server_id: 1001,
            flavor: Flavor::Mysql,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn build_opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .db_name(self.database.clone())
            .into()
    }
}

/// 풀 기반 MySQL 연결 래퍼
pub struct MySqlConnection {
    pool: Pool,
    config: ConnectionConfig,
}

impl MySqlConnection {
    pub fn new(config: ConnectionConfig) -> Self {
        let pool = Pool::new(config.build_opts());
        MySqlConnection { pool, config }
    }

    /// 풀을 만들고 한 번 접속해 연결 가능 여부를 확인
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        let conn = MySqlConnection::new(config);
        drop(conn.get_conn().await?);
        Ok(conn)
    }

    async fn get_conn(&self) -> Result<Conn> {
        tokio::time::timeout(self.config.timeout, self.pool.get_conn())
            .await
            .map_err(|_| {
                CdcError::ConnectionError(format!(
                    "timed out connecting to {}:{}",
                    self.config.hostname, self.config.port
                ))
            })?
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to MySQL: {}", e)))
    }

    /// 현재 binlog 파일과 위치 조회
    pub async fn get_binlog_status(&self) -> Result<BinlogPosition> {
        let mut conn = self.get_conn().await?;

        let rows: Vec<Row> = match self.config.flavor {
            Flavor::Mysql => match conn.query("SHOW BINARY LOG STATUS").await {
                Ok(rows) => rows,
                Err(e) => {
                    debug!("SHOW BINARY LOG STATUS failed ({}), falling back", e);
                    conn.query("SHOW MASTER STATUS").await?
                }
            },
            Flavor::Mariadb => conn.query("SHOW MASTER STATUS").await?,
        };

        let row = rows
            .first()
            .ok_or_else(|| CdcError::QueryError("No binlog status available".to_string()))?;
        let file: String = column(row, 0)?;
        let position: u64 = column(row, 1)?;

        Ok(BinlogPosition::new(file, position))
    }

    /// 전역 시스템 변수 조회
    pub async fn get_variable(&self, name: &str) -> Result<Option<String>> {
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(CdcError::QueryError(format!("invalid variable name {}", name)));
        }

        let mut conn = self.get_conn().await?;
        conn.query_first(format!("SELECT @@GLOBAL.{}", name))
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query {}: {}", name, e)))
    }

    /// Binlog 형식이 ROW 인지 확인
    pub async fn check_binlog_row_format(&self) -> Result<()> {
        let format = self
            .get_variable("binlog_format")
            .await?
            .ok_or_else(|| CdcError::QueryError("Binlog format not found".to_string()))?;

        if !format.eq_ignore_ascii_case("ROW") {
            return Err(CdcError::Config(format!(
                "binlog_format must be ROW, but got {}",
                format
            )));
        }
        Ok(())
    }

    pub async fn close(self) -> Result<()> {
        self.pool.disconnect().await.map_err(CdcError::from)
    }
}

#[async_trait]
impl SchemaProvider for MySqlConnection {
    async fn fetch_table(&self, database: &str, table: &str) -> Result<TableMetadata> {
        let mut conn = self.get_conn().await?;
        let params = (database.to_string(), table.to_string());

        let columns: Vec<(String, String)> = conn
            .exec(
                "SELECT COLUMN_NAME, DATA_TYPE \
                 FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                params.clone(),
            )
            .await?;

        if columns.is_empty() {
            return Err(CdcError::TableNotFound(format!("{}.{}", database, table)));
        }

        let pk_names: Vec<String> = conn
            .exec(
                "SELECT COLUMN_NAME \
                 FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY' \
                 ORDER BY ORDINAL_POSITION",
                params,
            )
            .await?;

        let columns: Vec<TableColumn> = columns
            .into_iter()
            .map(|(name, data_type)| TableColumn::new(name, ColumnType::from_data_type(&data_type)))
            .collect();

        let mut pk_columns = Vec::with_capacity(pk_names.len());
        for name in &pk_names {
            match columns.iter().position(|c| &c.name == name) {
                Some(index) => pk_columns.push(index),
                None => warn!("PK column {} not found in {}.{}", name, database, table),
            }
        }

        Ok(TableMetadata::new(database, table, columns, pk_columns))
    }
}

fn column<T: FromValue>(row: &Row, index: usize) -> Result<T> {
    match row.get_opt::<T, _>(index) {
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => Err(CdcError::QueryError(format!(
            "unexpected value at column {}: {:?}",
            index, e
        ))),
        None => Err(CdcError::QueryError(format!("missing column {}", index))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.port, 3306);
        assert_eq!(config.flavor, Flavor::Mysql);
    }

    #[test]
    fn test_connection_config_new() {
        let config = ConnectionConfig::new("127.0.0.1", "root");
        assert_eq!(config.hostname, "127.0.0.1");
        assert_eq!(config.username, "root");
    }

    #[test]
    fn test_flavor_parse() {
        assert_eq!("MariaDB".parse::<Flavor>().unwrap(), Flavor::Mariadb);
        assert!("postgres".parse::<Flavor>().is_err());
    }
}
