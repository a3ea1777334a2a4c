/// binlog-river 실행 파일
///
/// MySQL 의 기존 데이터를 덤프로 한 번 읽고, 이후 binlog 변경 사항을
/// JSON 라인으로 내보냅니다. 로그는 표준 에러로 출력됩니다.
use binlog_river::binlog_client::MySqlBinlogSource;
use binlog_river::cdc_engine::CdcEngine;
use binlog_river::config::{split_table, AppConfig, Cli};
use binlog_river::connection::MySqlConnection;
use binlog_river::consumer::JsonLinesConsumer;
use binlog_river::dump::MysqlDumper;
use binlog_river::error::{CdcError, Result};
use binlog_river::offset::FilePositionStore;
use binlog_river::schema::SchemaCache;
use clap::Parser;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::BufWriter;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // 로깅 초기화
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("binlog-river failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load(&cli)?;
    let conn_config = config.connection_config()?;

    info!(
        "Connecting to {}:{} as server_id {}",
        conn_config.hostname, conn_config.port, conn_config.server_id
    );
    let conn = Arc::new(MySqlConnection::connect(conn_config.clone()).await?);
    conn.check_binlog_row_format().await?;

    let schema = Arc::new(SchemaCache::new(conn));
    let store = Arc::new(FilePositionStore::open(&config.data_dir).await?);
    let source = Box::new(MySqlBinlogSource::new(conn_config));

    let mut engine = CdcEngine::new(config.engine.to_cdc_config(), schema, store, source);
    if let Some(dumper) = build_dumper(&config)? {
        engine.set_dumper(Arc::new(dumper));
    }

    let consumer = match &config.output {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| CdcError::Config(format!("open {}: {}", path.display(), e)))?;
            JsonLinesConsumer::new(Box::new(BufWriter::new(file)), config.max_actions)
        }
        None => JsonLinesConsumer::stdout(config.max_actions),
    };
    engine.add_consumer(Arc::new(consumer));

    let handle = engine.handle();
    let mut task = tokio::spawn(async move { engine.run().await });

    let joined = tokio::select! {
        joined = &mut task => joined,
        _ = wait_for_shutdown_signal() => {
            handle.close();
            task.await
        }
    };

    joined.map_err(|e| CdcError::IoError(format!("engine task failed: {}", e)))?
}

/// 덤프 실행 파일이 설정되어 있으면 mysqldump 실행기 생성
fn build_dumper(config: &AppConfig) -> Result<Option<MysqlDumper>> {
    if config.dump_exec.is_empty() {
        info!("dump_exec is empty, initial snapshot is disabled");
        return Ok(None);
    }

    let mut dumper = MysqlDumper::new(
        &config.dump_exec,
        &config.my_addr,
        config.my_user.clone(),
        config.my_pass.clone(),
    )?;

    if !config.dump.tables.is_empty() {
        dumper.add_tables(&config.dump.table_db, config.dump.tables.iter().cloned());
    } else {
        dumper.add_databases(config.dump.databases.iter().cloned());
    }

    let mut ignored: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for entry in &config.dump.ignore_tables {
        if let Some((db, table)) = split_table(entry) {
            ignored.entry(db).or_default().push(table);
        }
    }
    for (db, tables) in ignored {
        dumper.add_ignore_tables(db, tables);
    }

    Ok(Some(dumper))
}

/// Ctrl+C 또는 SIGTERM 대기
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, closing"),
        _ = terminate => info!("Received SIGTERM, closing"),
    }
}
