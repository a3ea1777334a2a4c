//! 실행 설정 - TOML 파일을 읽고 커맨드라인 인자로 덮어쓴다

use crate::cdc_engine::{CdcConfig, MissingPositionPolicy};
use crate::connection::{ConnectionConfig, Flavor};
use crate::consumer::ConsumerErrorPolicy;
use crate::dump::split_addr;
use crate::error::{CdcError, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// 기본 설정 파일 위치
pub const DEFAULT_CONFIG_PATH: &str = "./etc/river.toml";

/// MySQL binlog 을 따라가며 행 변경을 컨슈머에게 전달합니다
#[derive(Debug, Parser)]
#[command(name = "binlog-river")]
#[command(version)]
pub struct Cli {
    /// TOML 설정 파일
    #[arg(long, short = 'c', env = "RIVER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// MySQL 주소 (host:port)
    #[arg(long, env = "RIVER_MY_ADDR")]
    pub my_addr: Option<String>,

    #[arg(long, env = "RIVER_MY_USER")]
    pub my_user: Option<String>,

    #[arg(long, env = "RIVER_MY_PASS", hide_env_values = true)]
    pub my_pass: Option<String>,

    /// master.info 를 저장할 디렉터리
    #[arg(long, env = "RIVER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, env = "RIVER_SERVER_ID")]
    pub server_id: Option<u32>,

    /// mysql | mariadb
    #[arg(long, env = "RIVER_FLAVOR")]
    pub flavor: Option<Flavor>,

    /// mysqldump 실행 파일. 빈 문자열이면 스냅샷을 하지 않음
    #[arg(long, env = "RIVER_DUMP_EXEC")]
    pub dump_exec: Option<String>,

    #[arg(long, env = "RIVER_MAX_ACTIONS")]
    pub max_actions: Option<usize>,

    /// JSON 라인 출력 파일. 없으면 표준 출력
    #[arg(long, short = 'o', env = "RIVER_OUTPUT")]
    pub output: Option<PathBuf>,
}

/// 덤프 대상 선택
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpSection {
    pub databases: Vec<String>,
    /// `tables` 가 속한 데이터베이스
    pub table_db: String,
    pub tables: Vec<String>,
    /// `db.table` 형식
    pub ignore_tables: Vec<String>,
}

/// 엔진 튜닝 값
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub channel_capacity: usize,
    pub save_batch: usize,
    pub save_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
    pub consumer_error_policy: ConsumerErrorPolicy,
    pub missing_position: MissingPositionPolicy,
}

impl Default for EngineSection {
    fn default() -> Self {
        let defaults = CdcConfig::default();
        EngineSection {
            channel_capacity: defaults.channel_capacity,
            save_batch: defaults.save_batch,
            save_interval_ms: defaults.save_interval.as_millis() as u64,
            max_reconnect_attempts: defaults.max_reconnect_attempts,
            reconnect_backoff_ms: defaults.reconnect_backoff.as_millis() as u64,
            consumer_error_policy: defaults.consumer_error_policy,
            missing_position: defaults.missing_position,
        }
    }
}

impl EngineSection {
    pub fn to_cdc_config(&self) -> CdcConfig {
        CdcConfig {
            channel_capacity: self.channel_capacity,
            save_batch: self.save_batch,
            save_interval: Duration::from_millis(self.save_interval_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_ms),
            consumer_error_policy: self.consumer_error_policy,
            missing_position: self.missing_position,
        }
    }
}

/// 전체 실행 설정
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub my_addr: String,
    pub my_user: String,
    pub my_pass: String,
    pub server_id: u32,
    pub flavor: Flavor,
    pub data_dir: PathBuf,
    pub dump_exec: String,
    pub max_actions: usize,
    pub output: Option<PathBuf>,
    pub dump: DumpSection,
    pub engine: EngineSection,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            my_addr: "127.0.0.1:3306".to_string(),
            my_user: "root".to_string(),
            my_pass: String::new(),
            server_id: 1001,
            flavor: Flavor::Mysql,
            data_dir: PathBuf::from("./var"),
            dump_exec: "mysqldump".to_string(),
            max_actions: 100,
            output: None,
            dump: DumpSection::default(),
            engine: EngineSection::default(),
        }
    }
}

impl AppConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| CdcError::Config(format!("invalid config: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CdcError::Config(format!("read {}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// 설정 파일을 읽고 인자로 덮어쓴 뒤 검증.
    /// 기본 위치에 파일이 없으면 기본값으로 시작
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config = if cli.config.exists() {
            info!("Loading config from {}", cli.config.display());
            Self::from_file(&cli.config)?
        } else if cli.config == Path::new(DEFAULT_CONFIG_PATH) {
            warn!("{} not found, using defaults", DEFAULT_CONFIG_PATH);
            AppConfig::default()
        } else {
            return Err(CdcError::Config(format!(
                "config file {} not found",
                cli.config.display()
            )));
        };

        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(addr) = &cli.my_addr {
            self.my_addr = addr.clone();
        }
        if let Some(user) = &cli.my_user {
            self.my_user = user.clone();
        }
        if let Some(pass) = &cli.my_pass {
            self.my_pass = pass.clone();
        }
        if let Some(dir) = &cli.data_dir {
            self.data_dir = dir.clone();
        }
        if let Some(id) = cli.server_id {
            self.server_id = id;
        }
        if let Some(flavor) = cli.flavor {
            self.flavor = flavor;
        }
        if let Some(exec) = &cli.dump_exec {
            self.dump_exec = exec.clone();
        }
        if let Some(max) = cli.max_actions {
            self.max_actions = max;
        }
        if let Some(output) = &cli.output {
            self.output = Some(output.clone());
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.my_addr.trim().is_empty() {
            return Err(CdcError::Config("my_addr must not be empty".to_string()));
        }
        split_addr(&self.my_addr)?;
        if self.my_user.trim().is_empty() {
            return Err(CdcError::Config("my_user must not be empty".to_string()));
        }
        if self.server_id == 0 {
            return Err(CdcError::Config("server_id must not be 0".to_string()));
        }
        if self.max_actions == 0 {
            return Err(CdcError::Config("max_actions must be positive".to_string()));
        }
        if self.engine.save_batch == 0 || self.engine.channel_capacity == 0 {
            return Err(CdcError::Config(
                "engine.save_batch and engine.channel_capacity must be positive".to_string(),
            ));
        }
        if self.engine.save_interval_ms == 0 {
            return Err(CdcError::Config(
                "engine.save_interval_ms must be positive".to_string(),
            ));
        }
        if !self.dump.tables.is_empty() && self.dump.table_db.is_empty() {
            return Err(CdcError::Config(
                "dump.table_db is required when dump.tables is set".to_string(),
            ));
        }
        for entry in &self.dump.ignore_tables {
            if split_table(entry).is_none() {
                return Err(CdcError::Config(format!(
                    "ignore table {} must be db.table",
                    entry
                )));
            }
        }
        Ok(())
    }

    /// MySQL 연결 설정
    pub fn connection_config(&self) -> Result<ConnectionConfig> {
        let (hostname, port) = split_addr(&self.my_addr)?;
        Ok(ConnectionConfig {
            hostname,
            port,
            username: self.my_user.clone(),
            password: self.my_pass.clone(),
            server_id: self.server_id,
            flavor: self.flavor,
            ..Default::default()
        })
    }
}

/// `db.table` 분리
pub fn split_table(entry: &str) -> Option<(&str, &str)> {
    entry
        .split_once('.')
        .filter(|(db, table)| !db.is_empty() && !table.is_empty())
}
