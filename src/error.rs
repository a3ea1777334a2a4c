//! CDC 관련 에러 타입

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdcError {
    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("테이블을 찾을 수 없습니다: {0}")]
    TableNotFound(String),

    #[error("덤프 에러: {0}")]
    DumpError(String),

    /// 개별 행 디코딩 실패 - 해당 행만 건너뛴다
    #[error("행 건너뜀: {0}")]
    RowSkipped(String),

    #[error("유효하지 않은 이벤트: {0}")]
    InvalidEvent(String),

    #[error("기본 키 에러: {0}")]
    PrimaryKey(String),

    #[error("컨슈머 {consumer} 처리 실패: {message}")]
    ConsumerError { consumer: String, message: String },

    /// 정책과 무관하게 디스패치를 중단시키는 컨슈머 에러
    #[error("컨슈머 처리 중단: {0}")]
    HandleInterrupted(String),

    #[error("위치 저장소 에러: {0}")]
    PositionStore(String),

    #[error("설정 에러: {0}")]
    Config(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("채널이 닫혔습니다")]
    ChannelClosed,

    #[error("파이프라인이 종료되었습니다")]
    Closed,
}

impl CdcError {
    /// 재연결로 복구 가능한 연결 계열 에러인지 여부
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            CdcError::ConnectionError(_) | CdcError::IoError(_) | CdcError::ChannelClosed
        )
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

impl From<mysql_async::Error> for CdcError {
    fn from(err: mysql_async::Error) -> Self {
        match err {
            mysql_async::Error::Io(e) => CdcError::ConnectionError(e.to_string()),
            mysql_async::Error::Driver(e) => CdcError::ConnectionError(e.to_string()),
            other => CdcError::QueryError(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;
