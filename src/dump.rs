//! mysqldump 실행 및 텍스트 출력 파싱
//!
//! 덤프 협력자는 파싱한 항목을 순서대로 bounded 채널에 밀어 넣고,
//! 스냅샷 파서가 그 채널을 소비합니다. 위치 마커(`CHANGE MASTER TO ...`)는
//! `--master-data` 옵션으로 덤프 앞부분에 출력되므로 항상 행보다 먼저 도착합니다.

use crate::error::{CdcError, Result};
use crate::offset::BinlogPosition;
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// 덤프 한 행 (필드는 텍스트 표현 그대로, 문자열은 따옴표 포함)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpRow {
    pub database: String,
    pub table: String,
    pub fields: Vec<String>,
}

/// 덤프 스트림 항목
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpItem {
    Position(BinlogPosition),
    Row(DumpRow),
}

/// 스냅샷 덤프 협력자
#[async_trait]
pub trait Dumper: Send + Sync {
    /// 덤프를 실행해 항목을 순서대로 `tx` 로 보낸다.
    /// 수신 측이 닫히면 즉시 중단하고 `CdcError::Closed` 를 반환한다.
    async fn dump(&self, tx: mpsc::Sender<DumpItem>) -> Result<()>;
}

/// mysqldump 텍스트 출력 파서
pub struct DumpParser {
    database: Option<String>,
    use_exp: Regex,
    insert_exp: Regex,
    position_exp: Regex,
}

impl DumpParser {
    pub fn new(default_database: Option<String>) -> Result<Self> {
        let compile =
            |pattern: &str| Regex::new(pattern).map_err(|e| CdcError::DumpError(e.to_string()));

        Ok(DumpParser {
            database: default_database,
            use_exp: compile(r"^USE `(.+)`;$")?,
            insert_exp: compile(r"^INSERT INTO `(.+?)` VALUES (.+);$")?,
            position_exp: compile(
                r"^(?:-- )?CHANGE (?:MASTER|REPLICATION SOURCE) TO (?:MASTER|SOURCE)_LOG_FILE='(.+)', (?:MASTER|SOURCE)_LOG_POS=(\d+);$",
            )?,
        })
    }

    /// 한 줄을 파싱. 관심 없는 줄은 빈 결과
    pub fn parse_line(&mut self, line: &str) -> Result<Vec<DumpItem>> {
        if let Some(caps) = self.position_exp.captures(line) {
            let position = caps[2]
                .parse::<u64>()
                .map_err(|e| CdcError::DumpError(format!("invalid log position in {}: {}", line, e)))?;
            return Ok(vec![DumpItem::Position(BinlogPosition::new(&caps[1], position))]);
        }

        if let Some(caps) = self.use_exp.captures(line) {
            self.database = Some(caps[1].to_string());
            return Ok(Vec::new());
        }

        if let Some(caps) = self.insert_exp.captures(line) {
            let database = self.database.clone().ok_or_else(|| {
                CdcError::DumpError(format!("no database selected for row: {}", line))
            })?;
            let table = caps[1].to_string();
            let rows = parse_values(&caps[2])
                .map_err(|e| CdcError::DumpError(format!("parse values {} err: {}", line, e)))?;

            return Ok(rows
                .into_iter()
                .map(|fields| {
                    DumpItem::Row(DumpRow {
                        database: database.clone(),
                        table: table.clone(),
                        fields,
                    })
                })
                .collect());
        }

        Ok(Vec::new())
    }
}

/// `(1,'a'),(2,'b')` 형태의 VALUES 목록을 행 단위로 분리.
/// 쉼표로 바로 자를 수 없으므로 따옴표 문자열과 백슬래시 이스케이프를 고려한다.
fn parse_values(s: &str) -> std::result::Result<Vec<Vec<String>>, String> {
    let b = s.as_bytes();
    let len = b.len();
    let mut rows = Vec::new();
    let mut i = 0;

    loop {
        while i < len && b[i] == b' ' {
            i += 1;
        }
        if i >= len || b[i] != b'(' {
            return Err(format!("expected '(' at {}", i));
        }
        i += 1;

        let mut fields = Vec::new();
        loop {
            if i >= len {
                return Err("unterminated row".to_string());
            }

            if b[i] == b'\'' || b[i] == b'"' {
                let quote = b[i];
                let start = i;
                let mut j = i + 1;
                let mut escaped = false;
                while j < len {
                    if b[j] == b'\\' {
                        j += 2;
                        escaped = true;
                        continue;
                    }
                    if b[j] == quote {
                        break;
                    }
                    j += 1;
                }
                if j >= len {
                    return Err("parse quote values error".to_string());
                }

                let raw = &s[start..=j];
                fields.push(if escaped {
                    unescape(raw)
                } else {
                    raw.to_string()
                });
                i = j + 1;
            } else {
                let start = i;
                while i < len && b[i] != b',' && b[i] != b')' {
                    i += 1;
                }
                fields.push(s[start..i].trim().to_string());
            }

            if i >= len {
                return Err("unterminated row".to_string());
            }
            match b[i] {
                b',' => i += 1,
                b')' => {
                    i += 1;
                    break;
                }
                other => return Err(format!("unexpected '{}' at {}", other as char, i)),
            }
        }
        rows.push(fields);

        while i < len && b[i] == b' ' {
            i += 1;
        }
        if i >= len {
            break;
        }
        if b[i] != b',' {
            return Err(format!("expected ',' between rows at {}", i));
        }
        i += 1;
    }

    Ok(rows)
}

/// 바깥 따옴표는 유지하고 내부 MySQL 이스케이프 시퀀스만 해제
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('\0'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('b') => out.push('\u{8}'),
            Some('Z') => out.push('\u{1a}'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// 외부 mysqldump 실행기
#[derive(Debug, Clone)]
pub struct MysqlDumper {
    execution_path: PathBuf,
    host: String,
    port: u16,
    user: String,
    password: String,
    databases: Vec<String>,
    table_db: Option<String>,
    tables: Vec<String>,
    ignore_tables: Vec<String>,
}

impl MysqlDumper {
    /// `execution_path` 가 실행 가능한 위치에 없으면 에러
    pub fn new(
        execution_path: &str,
        addr: &str,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        let execution_path = look_path(execution_path).ok_or_else(|| {
            CdcError::Config(format!("dump executable {} not found", execution_path))
        })?;
        let (host, port) = split_addr(addr)?;

        Ok(MysqlDumper {
            execution_path,
            host,
            port,
            user: user.into(),
            password: password.into(),
            databases: Vec::new(),
            table_db: None,
            tables: Vec::new(),
            ignore_tables: Vec::new(),
        })
    }

    pub fn add_databases<I, S>(&mut self, dbs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.databases.extend(dbs.into_iter().map(Into::into));
    }

    /// 한 데이터베이스의 특정 테이블만 덤프. 다른 데이터베이스로 바꾸면 기존 목록은 초기화
    pub fn add_tables<I, S>(&mut self, db: &str, tables: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.table_db.as_deref() != Some(db) {
            self.tables.clear();
            self.table_db = Some(db.to_string());
        }
        self.tables.extend(tables.into_iter().map(Into::into));
    }

    pub fn add_ignore_tables<I, S>(&mut self, db: &str, tables: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.ignore_tables
            .extend(tables.into_iter().map(|t| format!("{}.{}", db, t.as_ref())));
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--host={}", self.host),
            format!("--port={}", self.port),
            format!("--user={}", self.user),
            format!("--password={}", self.password),
            "--master-data".to_string(),
            "--single-transaction".to_string(),
            "--skip-lock-tables".to_string(),
            "--compact".to_string(),
            "--skip-opt".to_string(),
            "--quick".to_string(),
            "--no-create-info".to_string(),
            "--skip-extended-insert".to_string(),
        ];

        for table in &self.ignore_tables {
            args.push(format!("--ignore-table={}", table));
        }

        if let Some(db) = &self.table_db {
            args.push(db.clone());
            args.extend(self.tables.iter().cloned());
        } else if !self.databases.is_empty() {
            args.push("--databases".to_string());
            args.extend(self.databases.iter().cloned());
        } else {
            args.push("--all-databases".to_string());
        }

        args
    }

    fn default_database(&self) -> Option<String> {
        self.table_db
            .clone()
            .or_else(|| self.databases.first().cloned())
    }
}

#[async_trait]
impl Dumper for MysqlDumper {
    async fn dump(&self, tx: mpsc::Sender<DumpItem>) -> Result<()> {
        let args = self.args();
        info!(
            "Running {} against {}:{}",
            self.execution_path.display(),
            self.host,
            self.port
        );

        let mut child = Command::new(&self.execution_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CdcError::DumpError(format!("failed to spawn dump: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CdcError::DumpError("dump stdout not captured".to_string()))?;
        let mut reader = BufReader::new(stdout);
        let mut parser = DumpParser::new(self.default_database())?;

        let mut buf = Vec::new();
        let mut lines = 0u64;
        loop {
            buf.clear();
            let n = reader
                .read_until(b'\n', &mut buf)
                .await
                .map_err(|e| CdcError::DumpError(format!("read dump output: {}", e)))?;
            if n == 0 {
                break;
            }
            lines += 1;

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\r', '\n']);
            for item in parser.parse_line(line)? {
                if tx.send(item).await.is_err() {
                    let _ = child.kill().await;
                    return Err(CdcError::Closed);
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| CdcError::DumpError(format!("wait for dump: {}", e)))?;
        if !status.success() {
            return Err(CdcError::DumpError(format!("dump exited with {}", status)));
        }

        debug!("Dump output finished after {} lines", lines);
        Ok(())
    }
}

pub(crate) fn split_addr(addr: &str) -> Result<(String, u16)> {
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| CdcError::Config(format!("invalid port in address {}", addr)))?;
            Ok((host.to_string(), port))
        }
        None => Ok((addr.to_string(), 3306)),
    }
}

/// 경로 구분자가 있으면 그대로, 없으면 PATH 에서 실행 파일 탐색
fn look_path(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if name.contains(std::path::MAIN_SEPARATOR) {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(name))
            .find(|p| p.is_file())
    })
}
