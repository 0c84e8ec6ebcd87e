//! デーモンのエントリポイント
//!
//! 3つの協調ループ（順方向 Watcher・逆方向同期・健全性チェック）を起動し、
//! 1つの HTTP クライアントと1つの SyncStore ハンドルを共有させる。
//! Ctrl-C でシャットダウンを要求し、猶予 30 秒で打ち切る。

use mailagent::config;
use mailagent::mail::arm::AppleScriptArm;
use mailagent::mail::health::HealthChecker;
use mailagent::mail::reverse_sync::ReverseSyncer;
use mailagent::notion::client::NotionClient;
use mailagent::notion::sync::NotionSyncer;
use mailagent::notion::uploader::FileUploader;
use mailagent::radar::SqliteRadar;
use mailagent::shutdown::Shutdown;
use mailagent::sync_store::SqliteSyncStore;
use mailagent::watcher::Watcher;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// 猶予シャットダウンの上限
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// 設定ディレクトリの環境変数（未設定ならカレントディレクトリ）
const CONFIG_DIR_ENV: &str = "MAILAGENT_CONFIG_DIR";

/// 初期バックフィル件数の環境変数
const BACKFILL_ENV: &str = "MAILAGENT_BACKFILL";

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

#[tokio::main]
async fn main() {
    init_logger();

    if let Err(e) = run().await {
        log::error!("{e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let config_dir = std::env::var(CONFIG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."));
    let config = config::load(&config_dir)?;

    // 致命的な設定エラーは起動時に落とす
    if config.notion.email_database_id.is_empty() {
        return Err("notion.email_database_id is not configured".to_string());
    }
    let token = config::notion_token()?;

    let store = Arc::new(
        SqliteSyncStore::open(Path::new(&config.sync.sync_store_path))
            .await
            .map_err(|e| e.to_string())?,
    );

    let radar = Arc::new(SqliteRadar::new(config.mail.mailboxes.clone()));
    let arm = Arc::new(AppleScriptArm::new(
        config.mail.account_name.clone(),
        config.mail.applescript_timeout_secs,
    ));

    let calendar_db_id = if config.notion.calendar_database_id.is_empty() {
        None
    } else {
        Some(config.notion.calendar_database_id.clone())
    };
    let client = Arc::new(NotionClient::new(
        token,
        config.notion.email_database_id.clone(),
        calendar_db_id,
    )?);
    let uploader = FileUploader::new(client.clone(), config.sync.max_attachment_bytes);
    let notion = Arc::new(NotionSyncer::new(client, uploader));

    let shutdown = Shutdown::new();

    let mut watcher = Watcher::new(
        radar.clone(),
        arm.clone(),
        store.clone(),
        notion.clone(),
        Duration::from_secs(config.sync.poll_interval_secs),
        config.sync.pending_batch_size,
        config.sync.retry_batch_size,
        config.sync.sync_start_date_utc(),
        shutdown.clone(),
    );
    let mut reverse = ReverseSyncer::new(
        arm.clone(),
        notion.clone(),
        Duration::from_secs(config.sync.reverse_sync_interval_secs),
        shutdown.clone(),
    );
    let health = HealthChecker::new(
        radar.clone(),
        store.clone(),
        Duration::from_secs(config.sync.health_check_interval_secs),
        shutdown.clone(),
    );

    // MAILAGENT_BACKFILL=N で起動時に過去 N 件を pending 登録する（初期同期用）
    if let Ok(value) = std::env::var(BACKFILL_ENV) {
        match value.parse::<usize>() {
            Ok(count) if count > 0 => {
                for mailbox in &config.mail.mailboxes {
                    match watcher.backfill(count, *mailbox, 0).await {
                        Ok(inserted) => log::info!(
                            "Backfill {}: {inserted} emails registered",
                            mailbox.as_str()
                        ),
                        Err(e) => log::error!("Backfill {} failed: {e}", mailbox.as_str()),
                    }
                }
            }
            _ => log::warn!("Ignoring invalid {BACKFILL_ENV} value: {value}"),
        }
    }

    let mut watcher_handle = tokio::spawn(async move { watcher.run().await });
    let reverse_handle = tokio::spawn(async move { reverse.run().await });
    let health_handle = tokio::spawn(async move { health.run().await });

    // Ctrl-C か Watcher の停止（不健全判定）まで待つ
    let mut watcher_result = None;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutdown signal received");
        }
        result = &mut watcher_handle => {
            watcher_result = Some(result);
        }
    }

    shutdown.request();

    // 進行中のページ作成を終えられるよう、猶予つきで全ループの終了を待つ
    let graceful = tokio::time::timeout(SHUTDOWN_DEADLINE, async {
        if watcher_result.is_none() {
            watcher_result = Some((&mut watcher_handle).await);
        }
        let _ = futures::future::join_all([reverse_handle, health_handle]).await;
    })
    .await;
    if graceful.is_err() {
        log::warn!(
            "Graceful shutdown exceeded {}s, exiting anyway",
            SHUTDOWN_DEADLINE.as_secs()
        );
    }

    match watcher_result {
        // Watcher 側から止まった場合は理由を伝播する
        Some(Ok(result)) => result,
        Some(Err(e)) => Err(format!("watcher task panicked: {e}")),
        None => Ok(()),
    }
}
