//! MySQL Binlog CDC (Change Data Capture) 파이프라인
//!
//! 이 라이브러리는 MySQL 의 기존 데이터를 덤프로 읽은 뒤 바이너리 로그를 따라가며
//! 행 변경 사항을 등록된 컨슈머에게 전달합니다.
//! 주요 기능:
//! - mysqldump 출력 파싱과 스냅샷
//! - Binlog 스트리밍과 재연결
//! - 커밋 단위 위치 마커 영속화
//! - 스키마 기반 기본 키 추출

pub mod binlog_client;
pub mod cdc_engine;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dump;
pub mod error;
pub mod events;
pub mod offset;
pub mod schema;
pub mod snapshot;
pub mod stream;

pub use binlog_client::MySqlBinlogSource;
pub use cdc_engine::{CdcConfig, CdcEngine, EngineHandle, MissingPositionPolicy};
pub use connection::MySqlConnection;
pub use consumer::{ConsumerErrorPolicy, Dispatcher, EventConsumer, JsonLinesConsumer};
pub use error::{CdcError, Result};
pub use events::{get_pk_values, RowAction, RowValue, RowsEvent};
pub use offset::{BinlogPosition, FilePositionStore, PositionStore, ProcessingState};
pub use schema::{ColumnType, SchemaCache, SchemaProvider, TableColumn, TableMetadata};
