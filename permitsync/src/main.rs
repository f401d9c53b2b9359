use std::process::ExitCode;
use std::sync::Arc;

use permitsync::config::{AppConfig, SetupFailure};
use permitsync::report;
use permitsync::status;
use permitsync::sync::driver::{self, SyncDriver};
use permitsync::sync::ledger::{HistoryStore, LedgerStore};
use permitsync::sync::scanner::RemoteScanner;
use permitsync::token_provider::TokenProvider;
use permitsync_core::{AuthClient, DriveClient, IngestClient};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Sync,
    Retry,
    Status,
    Report,
    Reconcile,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Sync;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "sync" => mode = CliMode::Sync,
            "retry" => mode = CliMode::Retry,
            "status" => mode = CliMode::Status,
            "report" => mode = CliMode::Report,
            "reconcile" => mode = CliMode::Reconcile,
            "--help" | "-h" | "help" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn print_usage() {
    println!("Usage: permitsync [sync|retry|status|report|reconcile]");
    println!("  sync       Upload new monitoring PDFs to the ingestion system (default)");
    println!("  retry      Re-run every item in the ledger's error list");
    println!("  status     Show ledger statistics and recent ingestion reports");
    println!("  report     Build the per-permit tracking CSV");
    println!("  reconcile  Check the government registry against the shared drive");
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let mode = match parse_cli_mode(std::env::args()) {
        Ok(mode) => mode,
        Err(err) => {
            eprintln!("[permitsync] {err}");
            print_usage();
            return ExitCode::from(2);
        }
    };
    if mode == CliMode::Help {
        print_usage();
        return ExitCode::SUCCESS;
    }

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("[permitsync] setup failed: {err}");
            return ExitCode::from(2);
        }
    };

    match run(mode, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if err.downcast_ref::<SetupFailure>().is_some() => {
            eprintln!("[permitsync] setup failed: {err}");
            ExitCode::from(2)
        }
        Err(err) => {
            eprintln!("[permitsync] error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(mode: CliMode, config: AppConfig) -> anyhow::Result<()> {
    let drive = DriveClient::new(&config.drive_api_base, &config.drive_token, &config.drive_id)
        .map_err(|err| SetupFailure(format!("drive client: {err}")))?;
    let ingest = IngestClient::new(&config.ingest_api_base)
        .map_err(|err| SetupFailure(format!("ingest client: {err}")))?;
    let auth = AuthClient::new(&config.auth_refresh_url)
        .map_err(|err| SetupFailure(format!("auth client: {err}")))?;
    let tokens = Arc::new(TokenProvider::new(
        auth,
        config.jwt_token.clone(),
        config.refresh_token.clone(),
    ));
    let ledger = Arc::new(
        LedgerStore::load(config.ledger_path())
            .map_err(|err| SetupFailure(format!("ledger load: {err}")))?,
    );
    let history = Arc::new(
        HistoryStore::load(config.history_path())
            .map_err(|err| SetupFailure(format!("history load: {err}")))?,
    );
    let scanner = RemoteScanner::new(drive.clone());
    let now = OffsetDateTime::now_utc();

    match mode {
        CliMode::Sync => {
            let sync_driver = Arc::new(
                SyncDriver::new(
                    drive,
                    ingest,
                    Arc::clone(&tokens),
                    Arc::clone(&ledger),
                    config.driver_options(),
                )
                .with_history(Arc::clone(&history)),
            );
            stop_on_ctrl_c(&sync_driver);
            driver::run_sync(&scanner, &sync_driver, &ledger, now, config.recent_days).await?;
        }
        CliMode::Retry => {
            let sync_driver = Arc::new(
                SyncDriver::new(
                    drive,
                    ingest,
                    Arc::clone(&tokens),
                    Arc::clone(&ledger),
                    config.driver_options(),
                )
                .with_history(Arc::clone(&history)),
            );
            stop_on_ctrl_c(&sync_driver);
            driver::run_retry(&sync_driver, &ledger).await?;
        }
        CliMode::Status => {
            status::run_status(&ledger, &history, &ingest, &tokens, &config.group_id).await?;
        }
        CliMode::Report => {
            report::run_report(
                &scanner,
                &ingest,
                &tokens,
                &ledger,
                &history.snapshot(),
                &config.group_id,
                &config.registry_url,
                &config.tracking_csv_path(),
                now,
            )
            .await?;
        }
        CliMode::Reconcile => {
            report::run_reconcile(&scanner, &ledger, &config.registry_url).await?;
        }
        CliMode::Help => unreachable!("help is handled before run()"),
    }
    Ok(())
}

fn stop_on_ctrl_c(sync_driver: &Arc<SyncDriver>) {
    let flag = sync_driver.interrupt_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("[permitsync] interrupt received, letting in-flight items finish");
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    });
}
