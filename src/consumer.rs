//! 이벤트 컨슈머 인터페이스와 디스패처
//!
//! 등록된 컨슈머들에게 등록 순서대로 동기적으로 이벤트를 전달합니다.

use crate::error::{CdcError, Result};
use crate::events::{get_pk_values, RowAction, RowValue, RowsEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, error};

/// 행 변경 이벤트 컨슈머 (예: 인덱싱 클라이언트)
#[async_trait]
pub trait EventConsumer: Send + Sync {
    fn name(&self) -> &str;

    async fn on_rows(&self, event: &RowsEvent) -> Result<()>;

    /// 스냅샷 완료 통지 - 스트리밍 시작 전에 배치 작업을 비우는 시점
    async fn on_snapshot_complete(&self) -> Result<()> {
        Ok(())
    }

    /// 위치 마커를 저장하기 직전에 호출됨. 버퍼링 중인 작업을 모두 반영해야 함
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// 컨슈머 에러 처리 정책
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerErrorPolicy {
    /// 첫 에러에서 디스패치 중단
    #[default]
    Halt,
    /// 로그만 남기고 계속 진행 (`HandleInterrupted` 는 예외)
    LogAndContinue,
}

/// 컨슈머 목록 디스패처
#[derive(Clone, Default)]
pub struct Dispatcher {
    consumers: Vec<Arc<dyn EventConsumer>>,
    policy: ConsumerErrorPolicy,
}

impl Dispatcher {
    pub fn new(policy: ConsumerErrorPolicy) -> Self {
        Dispatcher {
            consumers: Vec::new(),
            policy,
        }
    }

    pub fn register(&mut self, consumer: Arc<dyn EventConsumer>) {
        self.consumers.push(consumer);
    }

    pub async fn dispatch(&self, event: &RowsEvent) -> Result<()> {
        debug!("Dispatching {}", event);
        for consumer in &self.consumers {
            if let Err(e) = consumer.on_rows(event).await {
                self.handle_error(consumer.as_ref(), e)?;
            }
        }
        Ok(())
    }

    pub async fn snapshot_complete(&self) -> Result<()> {
        for consumer in &self.consumers {
            if let Err(e) = consumer.on_snapshot_complete().await {
                self.handle_error(consumer.as_ref(), e)?;
            }
        }
        Ok(())
    }

    /// 위치 저장 직전 호출. 비우지 못한 작업이 있으면 마커를 옮기면 안 되므로
    /// 정책과 무관하게 첫 에러를 반환
    pub async fn flush(&self) -> Result<()> {
        for consumer in &self.consumers {
            if let Err(e) = consumer.flush().await {
                error!("Consumer {} failed to flush: {}", consumer.name(), e);
                return Err(match e {
                    e @ (CdcError::HandleInterrupted(_) | CdcError::ConsumerError { .. }) => e,
                    e => CdcError::ConsumerError {
                        consumer: consumer.name().to_string(),
                        message: e.to_string(),
                    },
                });
            }
        }
        Ok(())
    }

    fn handle_error(&self, consumer: &dyn EventConsumer, err: CdcError) -> Result<()> {
        match (err, self.policy) {
            (err @ CdcError::HandleInterrupted(_), _) => {
                error!("Consumer {} interrupted dispatch: {}", consumer.name(), err);
                Err(err)
            }
            (err @ CdcError::ConsumerError { .. }, ConsumerErrorPolicy::Halt) => Err(err),
            (err, ConsumerErrorPolicy::Halt) => Err(CdcError::ConsumerError {
                consumer: consumer.name().to_string(),
                message: err.to_string(),
            }),
            (err, ConsumerErrorPolicy::LogAndContinue) => {
                error!("Consumer {} failed, continuing: {}", consumer.name(), err);
                Ok(())
            }
        }
    }
}

#[derive(Serialize)]
struct Document<'a> {
    database: &'a str,
    table: &'a str,
    action: RowAction,
    pk: Option<Vec<RowValue>>,
    row: &'a [RowValue],
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<&'a [RowValue]>,
}

struct JsonLinesState {
    writer: Box<dyn Write + Send>,
    pending: Vec<Vec<u8>>,
}

/// 이벤트를 JSON 한 줄씩 기록하는 컨슈머
///
/// `max_actions` 개 단위로 모아서 한 번에 기록합니다.
pub struct JsonLinesConsumer {
    state: Mutex<JsonLinesState>,
    max_actions: usize,
}

impl JsonLinesConsumer {
    pub fn new(writer: Box<dyn Write + Send>, max_actions: usize) -> Self {
        JsonLinesConsumer {
            state: Mutex::new(JsonLinesState {
                writer,
                pending: Vec::new(),
            }),
            max_actions: max_actions.max(1),
        }
    }

    pub fn stdout(max_actions: usize) -> Self {
        Self::new(Box::new(std::io::stdout()), max_actions)
    }

    fn documents(event: &RowsEvent) -> Result<Vec<Vec<u8>>> {
        let table = event.table();
        let mut lines = Vec::with_capacity(event.rows().len());

        let mut push = |row: &[RowValue],
                        before: Option<&[RowValue]>,
                        pk: Option<Vec<RowValue>>|
         -> Result<()> {
            let doc = Document {
                database: &table.database,
                table: &table.name,
                action: event.action(),
                pk,
                row,
                before,
            };
            let mut line = serde_json::to_vec(&doc)?;
            line.push(b'\n');
            lines.push(line);
            Ok(())
        };

        match event.action() {
            // 키 없는 테이블의 insert 는 키 없이 기록
            RowAction::Insert => {
                for row in event.rows() {
                    push(row, None, get_pk_values(table, row).ok())?;
                }
            }
            RowAction::Delete => {
                for row in event.rows() {
                    push(row, None, Some(get_pk_values(table, row)?))?;
                }
            }
            RowAction::Update => {
                for (before, after) in event.update_pairs() {
                    push(after, Some(before), Some(get_pk_values(table, after)?))?;
                }
            }
        }

        Ok(lines)
    }

    fn write_pending(state: &mut JsonLinesState) -> Result<()> {
        if state.pending.is_empty() {
            return Ok(());
        }
        // 기록에 실패하면 대기 중인 줄을 남겨 두고 다음 flush 에서 다시 기록
        for line in &state.pending {
            state.writer.write_all(line)?;
        }
        state.writer.flush()?;
        state.pending.clear();
        Ok(())
    }
}

#[async_trait]
impl EventConsumer for JsonLinesConsumer {
    fn name(&self) -> &str {
        "json-lines"
    }

    async fn on_rows(&self, event: &RowsEvent) -> Result<()> {
        let lines = Self::documents(event)?;

        let mut state = self.state.lock();
        state.pending.extend(lines);
        if state.pending.len() >= self.max_actions {
            Self::write_pending(&mut state)?;
        }
        Ok(())
    }

    async fn on_snapshot_complete(&self) -> Result<()> {
        Self::write_pending(&mut self.state.lock())
    }

    async fn flush(&self) -> Result<()> {
        Self::write_pending(&mut self.state.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, TableColumn, TableMetadata};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// 처음 `failures` 번의 flush 를 실패시키는 writer
    struct FlakyWriter {
        buf: SharedBuf,
        failures: usize,
    }

    impl Write for FlakyWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.buf.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed"));
            }
            Ok(())
        }
    }

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        fail_with: Option<fn() -> CdcError>,
    }

    #[async_trait]
    impl EventConsumer for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn on_rows(&self, event: &RowsEvent) -> Result<()> {
            self.log.lock().push(format!("{}:{}", self.name, event.action()));
            match self.fail_with {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }

        async fn flush(&self) -> Result<()> {
            self.log.lock().push(format!("{}:flush", self.name));
            match self.fail_with {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }
    }

    fn table(pk: Vec<usize>) -> Arc<TableMetadata> {
        Arc::new(TableMetadata::new(
            "test",
            "t",
            vec![
                TableColumn::new("id", ColumnType::Number),
                TableColumn::new("name", ColumnType::String),
            ],
            pk,
        ))
    }

    fn insert_event() -> RowsEvent {
        RowsEvent::new(
            table(vec![0]),
            RowAction::Insert,
            vec![vec![RowValue::Integer(1), RowValue::from("x")]],
        )
        .unwrap()
    }

    fn recorder(
        name: &str,
        log: &Arc<Mutex<Vec<String>>>,
        fail_with: Option<fn() -> CdcError>,
    ) -> Arc<dyn EventConsumer> {
        Arc::new(Recorder {
            name: name.to_string(),
            log: Arc::clone(log),
            fail_with,
        })
    }

    #[tokio::test]
    async fn test_dispatch_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new(ConsumerErrorPolicy::Halt);
        dispatcher.register(recorder("first", &log, None));
        dispatcher.register(recorder("second", &log, None));

        dispatcher.dispatch(&insert_event()).await.unwrap();
        assert_eq!(*log.lock(), vec!["first:insert", "second:insert"]);
    }

    #[tokio::test]
    async fn test_halt_stops_at_first_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new(ConsumerErrorPolicy::Halt);
        dispatcher.register(recorder(
            "broken",
            &log,
            Some(|| CdcError::IoError("bulk request failed".into())),
        ));
        dispatcher.register(recorder("second", &log, None));

        let err = dispatcher.dispatch(&insert_event()).await.unwrap_err();
        assert!(matches!(err, CdcError::ConsumerError { ref consumer, .. } if consumer == "broken"));
        assert_eq!(*log.lock(), vec!["broken:insert"]);
    }

    #[tokio::test]
    async fn test_log_and_continue_still_honours_interrupt() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new(ConsumerErrorPolicy::LogAndContinue);
        dispatcher.register(recorder(
            "flaky",
            &log,
            Some(|| CdcError::IoError("timeout".into())),
        ));
        dispatcher.register(recorder("second", &log, None));
        tokio_test::assert_ok!(dispatcher.dispatch(&insert_event()).await);
        assert_eq!(log.lock().len(), 2);

        let mut dispatcher = Dispatcher::new(ConsumerErrorPolicy::LogAndContinue);
        dispatcher.register(recorder(
            "stopper",
            &log,
            Some(|| CdcError::HandleInterrupted("shutdown".into())),
        ));
        let err = dispatcher.dispatch(&insert_event()).await.unwrap_err();
        assert!(matches!(err, CdcError::HandleInterrupted(_)));
    }

    #[tokio::test]
    async fn test_flush_failure_is_returned_under_any_policy() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new(ConsumerErrorPolicy::LogAndContinue);
        dispatcher.register(recorder(
            "sink",
            &log,
            Some(|| CdcError::IoError("bulk request failed".into())),
        ));
        dispatcher.register(recorder("second", &log, None));

        let err = dispatcher.flush().await.unwrap_err();
        assert!(matches!(err, CdcError::ConsumerError { ref consumer, .. } if consumer == "sink"));
        assert_eq!(*log.lock(), vec!["sink:flush"]);

        let mut dispatcher = Dispatcher::new(ConsumerErrorPolicy::LogAndContinue);
        dispatcher.register(recorder(
            "stopper",
            &log,
            Some(|| CdcError::HandleInterrupted("shutdown".into())),
        ));
        let err = dispatcher.flush().await.unwrap_err();
        assert!(matches!(err, CdcError::HandleInterrupted(_)));
    }

    #[tokio::test]
    async fn test_json_lines_keeps_pending_lines_after_write_failure() {
        let buf = SharedBuf::default();
        let writer = FlakyWriter {
            buf: buf.clone(),
            failures: 1,
        };
        let consumer = JsonLinesConsumer::new(Box::new(writer), 10);

        consumer.on_rows(&insert_event()).await.unwrap();
        consumer.on_rows(&insert_event()).await.unwrap();
        assert!(consumer.flush().await.is_err());

        buf.0.lock().clear();
        consumer.flush().await.unwrap();
        let written = String::from_utf8(buf.0.lock().clone()).unwrap();
        assert_eq!(written.lines().count(), 2);

        // 이미 기록된 줄은 다시 쓰지 않음
        buf.0.lock().clear();
        consumer.flush().await.unwrap();
        assert!(buf.0.lock().is_empty());
    }

    #[tokio::test]
    async fn test_json_lines_batches_until_flush() {
        let buf = SharedBuf::default();
        let consumer = JsonLinesConsumer::new(Box::new(buf.clone()), 2);

        consumer.on_rows(&insert_event()).await.unwrap();
        assert!(buf.0.lock().is_empty());

        consumer.on_rows(&insert_event()).await.unwrap();
        let written = String::from_utf8(buf.0.lock().clone()).unwrap();
        assert_eq!(written.lines().count(), 2);
        assert_eq!(
            written.lines().next().unwrap(),
            r#"{"database":"test","table":"t","action":"insert","pk":[1],"row":[1,"x"]}"#
        );

        let update = RowsEvent::new(
            table(vec![0]),
            RowAction::Update,
            vec![
                vec![RowValue::Integer(1), RowValue::from("x")],
                vec![RowValue::Integer(1), RowValue::from("z")],
            ],
        )
        .unwrap();
        consumer.on_rows(&update).await.unwrap();
        consumer.flush().await.unwrap();

        let written = String::from_utf8(buf.0.lock().clone()).unwrap();
        let last: serde_json::Value =
            serde_json::from_str(written.lines().last().unwrap()).unwrap();
        assert_eq!(last["action"], "update");
        assert_eq!(last["before"][1], "x");
        assert_eq!(last["row"][1], "z");
    }

    #[tokio::test]
    async fn test_json_lines_delete_requires_pk() {
        let consumer = JsonLinesConsumer::new(Box::new(SharedBuf::default()), 1);
        let delete = RowsEvent::new(
            table(vec![]),
            RowAction::Delete,
            vec![vec![RowValue::Integer(1), RowValue::from("x")]],
        )
        .unwrap();

        let err = consumer.on_rows(&delete).await.unwrap_err();
        assert!(matches!(err, CdcError::PrimaryKey(_)));
    }
}
