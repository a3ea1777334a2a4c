//! 복제 스트림 협력자 인터페이스와 스트림 변환기
//!
//! 복제 클라이언트가 바이트 수준에서 디코딩한 행 변경 통지를 스냅샷 경로와
//! 동일한 모양의 `RowsEvent` 로 정규화합니다.

use crate::error::Result;
use crate::events::{Row, RowAction, RowsEvent};
use crate::offset::BinlogPosition;
use crate::schema::SchemaCache;
use async_trait::async_trait;
use std::sync::Arc;

/// 디코딩된 행 변경 통지
///
/// update 의 `rows` 는 `[변경 전, 변경 후, ...]` 순서로 평탄화되어 있습니다.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRowsChange {
    pub database: String,
    pub table: String,
    pub action: RowAction,
    pub rows: Vec<Row>,
    /// 이 이벤트 직후의 로그 위치
    pub position: BinlogPosition,
}

/// 복제 스트림 항목 (커밋 순서)
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationEvent {
    Rows(RawRowsChange),
    /// 트랜잭션 커밋 - 재개 가능한 위치
    Commit(BinlogPosition),
    /// binlog 파일 교체
    Rotate(BinlogPosition),
}

/// 복제 스트림 협력자
#[async_trait]
pub trait ReplicationSource: Send {
    /// 서버의 현재 binlog 위치
    async fn current_position(&mut self) -> Result<BinlogPosition>;

    /// `from` 위치부터 스트림 (재)시작
    async fn open(&mut self, from: &BinlogPosition) -> Result<()>;

    /// 다음 이벤트. `None` 은 연결이 끊어졌음을 뜻함
    async fn next_event(&mut self) -> Result<Option<ReplicationEvent>>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// 스트림 변환기
pub struct StreamTranslator {
    schema: Arc<SchemaCache>,
}

impl StreamTranslator {
    pub fn new(schema: Arc<SchemaCache>) -> Self {
        StreamTranslator { schema }
    }

    pub async fn translate(&self, change: RawRowsChange) -> Result<RowsEvent> {
        let table = self
            .schema
            .get_table(&change.database, &change.table)
            .await?;
        RowsEvent::new(table, change.action, change.rows)
    }
}
