//! CDC 엔진 - 스냅샷 및 스트리밍 처리
//!
//! CDC 엔진은 다음 단계로 진행됩니다:
//! 1. 위치 마커 로드 (있으면 스냅샷 생략)
//! 2. 초기 스냅샷 (덤프의 모든 행을 insert 로 전달, 덤프 위치 저장)
//! 3. Binlog 스트리밍 (커밋 단위로 위치 마커 전진, 연결이 끊기면 재연결)
//!
//! 상태는 `Idle → Bootstrapping → Streaming → Closed` 순서로만 바뀌며,
//! 에러로 끝난 경우에도 `Closed` 가 됩니다.

use crate::consumer::{ConsumerErrorPolicy, Dispatcher, EventConsumer};
use crate::dump::Dumper;
use crate::error::{CdcError, Result};
use crate::offset::{BinlogPosition, PositionStore, ProcessingState};
use crate::schema::SchemaCache;
use crate::snapshot::SnapshotParser;
use crate::stream::{ReplicationEvent, ReplicationSource, StreamTranslator};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 위치 마커도 덤프 수단도 없을 때의 동작
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingPositionPolicy {
    /// 시작 실패
    #[default]
    Abort,
    /// 서버의 현재 binlog 위치부터 스트리밍 (기존 데이터는 전달되지 않음)
    StreamFromCurrent,
}

/// CDC 엔진 설정
#[derive(Debug, Clone)]
pub struct CdcConfig {
    /// 수신 태스크와 디스패치 사이 채널 크기
    pub channel_capacity: usize,
    /// 이 수만큼 커밋이 쌓이면 위치 저장
    pub save_batch: usize,
    /// 마지막 저장 후 이 시간이 지나면 위치 저장
    pub save_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
    pub consumer_error_policy: ConsumerErrorPolicy,
    pub missing_position: MissingPositionPolicy,
}

impl Default for CdcConfig {
    fn default() -> Self {
        CdcConfig {
            channel_capacity: 4096,
            save_batch: 128,
            save_interval: Duration::from_secs(3),
            max_reconnect_attempts: 10,
            reconnect_backoff: Duration::from_secs(1),
            consumer_error_policy: ConsumerErrorPolicy::Halt,
            missing_position: MissingPositionPolicy::Abort,
        }
    }
}

/// 실행 중인 엔진을 외부에서 종료하거나 상태를 조회하는 핸들
#[derive(Clone)]
pub struct EngineHandle {
    cancel: CancellationToken,
    state: Arc<RwLock<ProcessingState>>,
}

impl EngineHandle {
    /// 종료 요청. 여러 번 호출해도 안전
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> ProcessingState {
        *self.state.read()
    }
}

/// 디스패치 루프 종료 사유
enum DispatchExit {
    /// 종료 요청
    Closed,
    /// 수신 태스크가 끝남 (연결 끊김 등)
    Drained,
    /// 변환 중 연결 에러 - 마지막 커밋 위치부터 다시 연결
    Reconnect(CdcError),
}

/// MySQL CDC 엔진
pub struct CdcEngine {
    config: CdcConfig,
    schema: Arc<SchemaCache>,
    store: Arc<dyn PositionStore>,
    source: Option<Box<dyn ReplicationSource>>,
    dumper: Option<Arc<dyn Dumper>>,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
    state: Arc<RwLock<ProcessingState>>,
    /// 마지막으로 적용이 끝난 위치
    position: Option<BinlogPosition>,
    saved: Option<BinlogPosition>,
    unsaved_commits: usize,
    last_save: Instant,
    /// 스키마를 찾지 못해 스트리밍에서 제외한 `db.table`
    skipped_tables: HashSet<String>,
}

impl CdcEngine {
    /// 새 CDC 엔진 생성
    pub fn new(
        config: CdcConfig,
        schema: Arc<SchemaCache>,
        store: Arc<dyn PositionStore>,
        source: Box<dyn ReplicationSource>,
    ) -> Self {
        let dispatcher = Dispatcher::new(config.consumer_error_policy);
        CdcEngine {
            config,
            schema,
            store,
            source: Some(source),
            dumper: None,
            dispatcher,
            cancel: CancellationToken::new(),
            state: Arc::new(RwLock::new(ProcessingState::Idle)),
            position: None,
            saved: None,
            unsaved_commits: 0,
            last_save: Instant::now(),
            skipped_tables: HashSet::new(),
        }
    }

    pub fn with_dumper(mut self, dumper: Arc<dyn Dumper>) -> Self {
        self.set_dumper(dumper);
        self
    }

    pub fn set_dumper(&mut self, dumper: Arc<dyn Dumper>) {
        self.dumper = Some(dumper);
    }

    /// 컨슈머 등록. 등록 순서대로 이벤트를 받는다
    pub fn add_consumer(&mut self, consumer: Arc<dyn EventConsumer>) {
        info!("Registered consumer {}", consumer.name());
        self.dispatcher.register(consumer);
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            cancel: self.cancel.clone(),
            state: Arc::clone(&self.state),
        }
    }

    /// 상태 조회
    pub fn get_state(&self) -> ProcessingState {
        *self.state.read()
    }

    /// 현재 적용된 위치 반환
    pub fn get_position(&self) -> Option<&BinlogPosition> {
        self.position.as_ref()
    }

    fn set_state(&self, state: ProcessingState) {
        let mut current = self.state.write();
        if *current != state {
            debug!("State {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    /// 종료 요청이나 복구 불가능한 에러가 생길 때까지 실행
    ///
    /// 종료 요청으로 끝나면 컨슈머를 비우고 마지막 위치를 내구성 있게 저장한 뒤 `Ok`.
    /// 스냅샷이 끝나기 전에 종료되면 위치를 저장하지 않고 `CdcError::Closed`.
    /// 이미 종료된 엔진에서 다시 호출하면 `CdcError::Closed`.
    pub async fn run(&mut self) -> Result<()> {
        if self.get_state() != ProcessingState::Idle {
            return Err(CdcError::Closed);
        }

        info!("Starting CDC Engine");
        let result = if self.cancel.is_cancelled() {
            Ok(())
        } else {
            match self.bootstrap().await {
                Ok(()) => self.stream().await,
                Err(e) => Err(e),
            }
        };

        let result = match result {
            Ok(()) => self.persist(true).await,
            // 스냅샷 도중 종료 요청 - 다음 시작에서 스냅샷을 다시 함
            Err(CdcError::Closed) => {
                error!("Closed before the snapshot completed, binlog position is not saved");
                Err(CdcError::Closed)
            }
            Err(e) => Err(e),
        };

        if let Some(source) = self.source.as_mut() {
            if let Err(e) = source.close().await {
                debug!("Error while closing replication source: {}", e);
            }
        }
        self.cancel.cancel();
        self.set_state(ProcessingState::Closed);

        match &result {
            Ok(()) => info!("CDC Engine stopped"),
            Err(e) => error!("CDC Engine stopped with error: {}", e),
        }
        result
    }

    /// 시작 위치 결정. 마커가 없으면 스냅샷으로 만든다
    async fn bootstrap(&mut self) -> Result<()> {
        let start = match self.store.load().await? {
            Some(position) => {
                info!("Resuming from stored binlog position {}", position);
                self.saved = Some(position.clone());
                position
            }
            None => match self.dumper.clone() {
                Some(dumper) => {
                    self.set_state(ProcessingState::Bootstrapping);
                    let parser =
                        SnapshotParser::new(Arc::clone(&self.schema), self.config.channel_capacity);
                    let outcome = parser.run(dumper, &self.dispatcher, &self.cancel).await?;

                    self.position = Some(outcome.position.clone());
                    self.persist(true).await?;
                    outcome.position
                }
                None => match self.config.missing_position {
                    MissingPositionPolicy::Abort => {
                        return Err(CdcError::Config(
                            "no binlog position is stored and no dumper is configured".to_string(),
                        ))
                    }
                    MissingPositionPolicy::StreamFromCurrent => {
                        let source = self.source.as_mut().ok_or_else(|| {
                            CdcError::Config("replication source is not available".to_string())
                        })?;
                        let position = source.current_position().await?;
                        warn!(
                            "No binlog position and no dumper, streaming from current position {}",
                            position
                        );
                        position
                    }
                },
            },
        };

        self.position = Some(start);
        Ok(())
    }

    /// 스트리밍 단계. 연결이 끊기면 마지막으로 적용한 위치부터 재연결
    async fn stream(&mut self) -> Result<()> {
        self.set_state(ProcessingState::Streaming);
        let translator = StreamTranslator::new(Arc::clone(&self.schema));
        let mut attempts = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let resume = self
                .position
                .clone()
                .ok_or_else(|| CdcError::Config("streaming without a binlog position".to_string()))?;
            let source = self.source.as_mut().ok_or_else(|| {
                CdcError::Config("replication source is not available".to_string())
            })?;

            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                opened = source.open(&resume) => opened,
            };
            if let Err(e) = opened {
                self.wait_before_retry(&mut attempts, e).await?;
                continue;
            }
            info!("Streaming binlog from {}", resume);

            match self.stream_session(&translator, &mut attempts).await? {
                None => return Ok(()),
                Some(e) => self.wait_before_retry(&mut attempts, e).await?,
            }
        }
    }

    /// 열린 소스 하나로 수신 태스크와 디스패치 루프를 돌린다.
    /// 종료 요청이면 `None`, 수신이 끊기면 그 원인 에러를 반환
    async fn stream_session(
        &mut self,
        translator: &StreamTranslator,
        attempts: &mut u32,
    ) -> Result<Option<CdcError>> {
        let source = self
            .source
            .take()
            .ok_or_else(|| CdcError::Config("replication source is not available".to_string()))?;

        let reader_cancel = self.cancel.child_token();
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let reader = tokio::spawn(receive_events(source, tx, reader_cancel.clone()));

        let dispatched = self.dispatch_events(rx, translator, attempts).await;

        reader_cancel.cancel();
        let (source, received) = reader.await.map_err(|e| {
            CdcError::ConnectionError(format!("replication reader task failed: {}", e))
        })?;
        self.source = Some(source);

        match dispatched? {
            DispatchExit::Closed => Ok(None),
            DispatchExit::Drained => Ok(Some(match received {
                Err(e) => e,
                Ok(()) => CdcError::ChannelClosed,
            })),
            DispatchExit::Reconnect(e) => Ok(Some(e)),
        }
    }

    async fn dispatch_events(
        &mut self,
        mut rx: mpsc::Receiver<ReplicationEvent>,
        translator: &StreamTranslator,
        attempts: &mut u32,
    ) -> Result<DispatchExit> {
        let period = self.config.save_interval.max(Duration::from_millis(1));
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(DispatchExit::Closed),
                _ = ticker.tick() => None,
                event = rx.recv() => Some(event),
            };

            let event = match next {
                // 주기적 저장
                None => {
                    if self.unsaved_commits > 0 {
                        self.persist(false).await?;
                    }
                    continue;
                }
                Some(None) => return Ok(DispatchExit::Drained),
                Some(Some(event)) => event,
            };

            match event {
                ReplicationEvent::Rows(change) => {
                    let key = format!("{}.{}", change.database, change.table);
                    if self.skipped_tables.contains(&key) {
                        debug!("Dropping rows event of {} at {}", key, change.position);
                        continue;
                    }

                    let at = change.position.clone();
                    let event = match translator.translate(change).await {
                        Ok(event) => event,
                        Err(e) if e.is_connection_error() => {
                            warn!("Schema lookup for {} at {} lost connection: {}", key, at, e);
                            return Ok(DispatchExit::Reconnect(e));
                        }
                        // 스키마를 알 수 없는 테이블은 이후 스트리밍에서 제외
                        Err(e @ (CdcError::TableNotFound(_) | CdcError::QueryError(_))) => {
                            error!(
                                "Schema lookup for {} at {} failed, skipping the table from now on: {}",
                                key, at, e
                            );
                            self.skipped_tables.insert(key);
                            continue;
                        }
                        Err(e) => {
                            error!("Failed to translate rows event at {}: {}", at, e);
                            return Err(e);
                        }
                    };
                    self.dispatcher.dispatch(&event).await?;
                }
                ReplicationEvent::Commit(position) => {
                    debug!("Commit at {}", position);
                    self.position = Some(position);
                    self.unsaved_commits += 1;
                    if self.unsaved_commits >= self.config.save_batch.max(1)
                        || self.last_save.elapsed() >= self.config.save_interval
                    {
                        self.persist(false).await?;
                    }
                }
                ReplicationEvent::Rotate(position) => {
                    info!("Rotate binlog to {}", position);
                    self.position = Some(position);
                    self.persist(true).await?;
                }
            }
            // 이벤트를 끝까지 처리했을 때만 재연결 시도 횟수를 초기화
            *attempts = 0;
        }
    }

    /// 연결 에러면 대기 후 재시도, 재시도 한도를 넘거나 다른 에러면 그대로 반환
    async fn wait_before_retry(&mut self, attempts: &mut u32, err: CdcError) -> Result<()> {
        if !err.is_connection_error() {
            return Err(err);
        }

        *attempts += 1;
        if *attempts > self.config.max_reconnect_attempts {
            error!(
                "Giving up after {} reconnect attempts: {}",
                self.config.max_reconnect_attempts, err
            );
            return Err(err);
        }

        warn!(
            "Replication connection lost ({}), reconnecting in {:?} (attempt {}/{})",
            err, self.config.reconnect_backoff, attempts, self.config.max_reconnect_attempts
        );
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = time::sleep(self.config.reconnect_backoff) => {}
        }
        Ok(())
    }

    /// 컨슈머를 비운 뒤 위치 저장
    async fn persist(&mut self, force_sync: bool) -> Result<()> {
        let Some(position) = self.position.clone() else {
            return Ok(());
        };
        if !force_sync && self.saved.as_ref() == Some(&position) {
            self.unsaved_commits = 0;
            return Ok(());
        }

        self.dispatcher.flush().await?;
        self.store.save(&position, force_sync).await?;

        debug!("Saved binlog position {}", position);
        self.saved = Some(position);
        self.unsaved_commits = 0;
        self.last_save = Instant::now();
        Ok(())
    }
}

/// 수신 태스크. 소스를 돌려주어 재연결에 다시 쓸 수 있게 한다
async fn receive_events(
    mut source: Box<dyn ReplicationSource>,
    tx: mpsc::Sender<ReplicationEvent>,
    cancel: CancellationToken,
) -> (Box<dyn ReplicationSource>, Result<()>) {
    let result = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            next = source.next_event() => next,
        };

        match next {
            Ok(Some(event)) => {
                tokio::select! {
                    _ = cancel.cancelled() => break Ok(()),
                    sent = tx.send(event) => {
                        if sent.is_err() {
                            break Ok(());
                        }
                    }
                }
            }
            Ok(None) => {
                break Err(CdcError::ConnectionError(
                    "replication stream ended".to_string(),
                ))
            }
            Err(e) => break Err(e),
        }
    };
    (source, result)
}
