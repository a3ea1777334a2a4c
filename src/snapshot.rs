//! 스냅샷 파서 - 덤프 행을 insert 이벤트로 변환
//!
//! 필드 디코딩 규칙 (컬럼 타입 기준, 위치별):
//! 1. `NULL` → null
//! 2. 같은 종류의 따옴표로 감싼 값 → 바깥 따옴표만 제거한 문자열
//! 3. 그 외에는 컬럼 타입에 따라 NUMBER → i64, FLOAT → f64, 나머지 타입은 디코딩 에러
//!
//! 디코딩 에러는 해당 행만 건너뛰고, 스키마 조회 실패나 덤프 실패, 종료 요청은
//! 스냅샷 전체를 실패시킵니다.

use crate::consumer::Dispatcher;
use crate::dump::{DumpItem, DumpRow, Dumper};
use crate::error::{CdcError, Result};
use crate::events::{Row, RowAction, RowValue, RowsEvent};
use crate::offset::BinlogPosition;
use crate::schema::{ColumnType, SchemaCache, TableMetadata};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 스냅샷 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotOutcome {
    /// 덤프가 캡처한 binlog 위치 - 스트리밍 시작 지점
    pub position: BinlogPosition,
    pub rows: u64,
    pub skipped: u64,
}

/// 덤프 한 행을 디코딩. 실패하면 `CdcError::RowSkipped`
pub fn decode_row(table: &TableMetadata, fields: &[String]) -> Result<Row> {
    if fields.len() > table.columns.len() {
        return Err(CdcError::RowSkipped(format!(
            "row {:?} has {} fields but {} has {} columns",
            fields,
            fields.len(),
            table,
            table.columns.len()
        )));
    }

    fields
        .iter()
        .enumerate()
        .map(|(i, field)| decode_field(table.columns[i].column_type, field))
        .collect::<std::result::Result<Row, String>>()
        .map_err(|reason| CdcError::RowSkipped(format!("parse row {:?} error: {}", fields, reason)))
}

fn decode_field(column_type: ColumnType, field: &str) -> std::result::Result<RowValue, String> {
    if field == "NULL" {
        return Ok(RowValue::Null);
    }
    if is_quoted(field) {
        return Ok(RowValue::String(field[1..field.len() - 1].to_string()));
    }

    match column_type {
        ColumnType::Number => field
            .parse::<i64>()
            .map(RowValue::Integer)
            .map_err(|e| format!("{:?} is not a number: {}", field, e)),
        ColumnType::Float => field
            .parse::<f64>()
            .map(RowValue::Float)
            .map_err(|e| format!("{:?} is not a float: {}", field, e)),
        other => Err(format!("invalid type {:?} for value {:?}", other, field)),
    }
}

fn is_quoted(field: &str) -> bool {
    let bytes = field.as_bytes();
    bytes.len() >= 2
        && (bytes[0] == b'\'' || bytes[0] == b'"')
        && bytes[bytes.len() - 1] == bytes[0]
}

/// 스냅샷 파서
pub struct SnapshotParser {
    schema: Arc<SchemaCache>,
    channel_capacity: usize,
}

impl SnapshotParser {
    pub fn new(schema: Arc<SchemaCache>, channel_capacity: usize) -> Self {
        SnapshotParser {
            schema,
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// 덤프를 실행하고 모든 행을 컨슈머에게 전달한 뒤 완료 통지를 보낸다
    pub async fn run(
        &self,
        dumper: Arc<dyn Dumper>,
        dispatcher: &Dispatcher,
        cancel: &CancellationToken,
    ) -> Result<SnapshotOutcome> {
        let start = Instant::now();
        info!("Start dump");

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let dump_task = tokio::spawn(async move { dumper.dump(tx).await });

        let mut stats = (0u64, 0u64);
        let consumed = self.consume(rx, dispatcher, cancel, &mut stats).await;

        let position = match consumed {
            Ok(position) => position,
            Err(e) => {
                // 덤프 프로세스는 kill_on_drop 으로 정리됨
                dump_task.abort();
                let _ = dump_task.await;
                error!("Dump aborted after {} rows: {}", stats.0, e);
                return Err(e);
            }
        };

        match dump_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(e) => return Err(CdcError::DumpError(format!("dump task failed: {}", e))),
        }

        let position = position.ok_or_else(|| {
            CdcError::DumpError("dump finished without a binlog position".to_string())
        })?;

        dispatcher.snapshot_complete().await?;

        let (rows, skipped) = stats;
        info!(
            "Dump completed in {:.2} seconds: {} rows, {} skipped, position {}",
            start.elapsed().as_secs_f64(),
            rows,
            skipped,
            position
        );

        Ok(SnapshotOutcome {
            position,
            rows,
            skipped,
        })
    }

    async fn consume(
        &self,
        mut rx: mpsc::Receiver<DumpItem>,
        dispatcher: &Dispatcher,
        cancel: &CancellationToken,
        stats: &mut (u64, u64),
    ) -> Result<Option<BinlogPosition>> {
        let mut position = None;

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return Err(CdcError::Closed),
                item = rx.recv() => item,
            };

            match item {
                None => return Ok(position),
                Some(DumpItem::Position(pos)) => {
                    info!("Dump captured binlog position {}", pos);
                    position = Some(pos);
                }
                Some(DumpItem::Row(row)) => {
                    if cancel.is_cancelled() {
                        return Err(CdcError::Closed);
                    }
                    if self.handle_row(row, dispatcher).await? {
                        stats.0 += 1;
                    } else {
                        stats.1 += 1;
                    }
                }
            }
        }
    }

    /// 행을 전달했으면 true, 건너뛰었으면 false
    async fn handle_row(&self, row: DumpRow, dispatcher: &Dispatcher) -> Result<bool> {
        let table = self
            .schema
            .get_table(&row.database, &row.table)
            .await
            .map_err(|e| {
                error!("get {}.{} information err: {}", row.database, row.table, e);
                e
            })?;

        let values = match decode_row(&table, &row.fields) {
            Ok(values) => values,
            Err(e) => {
                warn!("{}, skip", e);
                return Ok(false);
            }
        };

        let event = RowsEvent::new(table, RowAction::Insert, vec![values])?;
        dispatcher.dispatch(&event).await?;
        Ok(true)
    }
}
