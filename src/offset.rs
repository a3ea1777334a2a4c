//! Binlog 처리 위치 추적 및 영속화
//!
//! Binlog 파일명 + 위치로 정확한 재시작 지점을 추적합니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치

use crate::error::{CdcError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// 위치 파일 이름
pub const MASTER_INFO_FILE: &str = "master.info";

/// Binlog 파일 위치 정보
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BinlogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub filename: String,
    /// 바이트 위치
    pub position: u64,
}

impl BinlogPosition {
    pub fn new(filename: impl Into<String>, position: u64) -> Self {
        BinlogPosition {
            filename: filename.into(),
            position,
        }
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.position)
    }
}

/// 파이프라인 처리 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingState {
    Idle,
    /// 스냅샷 처리 중
    Bootstrapping,
    /// 스트리밍 처리 중
    Streaming,
    /// 종료됨 (에러 종료 포함)
    Closed,
}

/// 위치 마커 저장소
///
/// `load` 가 `None` 을 반환하면 마커가 설정되지 않은 상태(새로 시작)입니다.
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn load(&self) -> Result<Option<BinlogPosition>>;

    /// `force_sync` 가 true 이면 디스크에 내구성 있게 기록될 때까지 대기
    async fn save(&self, position: &BinlogPosition, force_sync: bool) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct MasterInfo {
    bin_name: String,
    bin_pos: u64,
    updated_at: DateTime<Utc>,
}

/// 데이터 디렉터리의 `master.info` 파일 기반 위치 저장소
pub struct FilePositionStore {
    dir: PathBuf,
    path: PathBuf,
}

impl FilePositionStore {
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.map_err(|e| {
            CdcError::PositionStore(format!("create data dir {}: {}", dir.display(), e))
        })?;
        let path = dir.join(MASTER_INFO_FILE);
        Ok(FilePositionStore { dir, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PositionStore for FilePositionStore {
    async fn load(&self) -> Result<Option<BinlogPosition>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CdcError::PositionStore(format!(
                    "read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        if contents.trim().is_empty() {
            return Ok(None);
        }

        let info: MasterInfo = serde_json::from_str(&contents)?;
        if info.bin_name.is_empty() {
            return Ok(None);
        }

        let position = BinlogPosition::new(info.bin_name, info.bin_pos);
        info!("Loaded binlog position {} from {}", position, self.path.display());
        Ok(Some(position))
    }

    async fn save(&self, position: &BinlogPosition, force_sync: bool) -> Result<()> {
        let info = MasterInfo {
            bin_name: position.filename.clone(),
            bin_pos: position.position,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&info)?;

        // 임시 파일에 쓰고 rename 으로 교체
        let temp_path = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await
            .map_err(|e| CdcError::PositionStore(format!("open {}: {}", temp_path.display(), e)))?;
        file.write_all(&json).await?;
        if force_sync {
            file.sync_all().await?;
        }
        drop(file);

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            CdcError::PositionStore(format!("rename to {}: {}", self.path.display(), e))
        })?;

        if force_sync {
            if let Ok(dir) = File::open(&self.dir).await {
                let _ = dir.sync_all().await;
            }
        }

        debug!("Saved binlog position {} (force_sync={})", position, force_sync);
        Ok(())
    }
}
