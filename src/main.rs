use std::process::ExitCode;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use pivnet_fetch::cli::Cli;
use pivnet_fetch::download::{DownloadConfig, DownloadManager, FinalReport};
use pivnet_fetch::util::format_bytes;
use pivnet_fetch::DownloadError;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // --help and --version land here too
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            return ExitCode::from(code);
        }
    };
    init_logger(&cli);
    let json = cli.json;

    let config = match DownloadConfig::try_from(cli) {
        Ok(config) => config,
        Err(err) => return fail(&anyhow::Error::new(err)),
    };
    // the GSSAPI library reads these once; set them while still single threaded
    if let Some(proxy) = &config.proxy {
        proxy.export_kerberos_environment();
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => return fail(&anyhow::Error::new(err).context("could not start the runtime")),
    };
    match runtime.block_on(run(config)) {
        Ok(report) => {
            print_report(&report, json);
            ExitCode::SUCCESS
        }
        Err(err) => fail(&err),
    }
}

fn fail(err: &anyhow::Error) -> ExitCode {
    let failure = err.downcast_ref::<DownloadError>();
    let code = failure.map_or(1, DownloadError::exit_code);
    match failure {
        Some(failure) => error!("{err:#} [{}]", failure.kind()),
        None => error!("{err:#}"),
    }
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn run(config: DownloadConfig) -> Result<FinalReport> {
    debug!("output directory: {}", config.output_dir.display());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; cancelling the download");
            on_signal.cancel();
        }
    });

    let manager = DownloadManager::new(config)?;
    let report = manager.run(cancel).await.context("download failed")?;
    Ok(report)
}

fn print_report(report: &FinalReport, json: bool) {
    if json {
        let summary = serde_json::json!({
            "event": "report",
            "file": report.file.display().to_string(),
            "version": report.version,
            "bytes": report.bytes,
            "elapsed_ms": report.elapsed.as_millis() as u64,
            "bytes_per_second": report.bytes_per_second(),
            "digest": report.digest.as_ref().map(ToString::to_string),
            "skipped": report.skipped,
            "release_id": report.release_id,
            "stemcell": report.stemcell.as_ref().map(|stemcell| serde_json::json!({
                "file": stemcell.file.display().to_string(),
                "version": stemcell.version,
                "bytes": stemcell.bytes,
                "skipped": stemcell.skipped,
            })),
        });
        println!("{summary}");
    } else {
        let verb = if report.skipped { "kept" } else { "saved" };
        info!(
            "{verb} {} ({}, version {})",
            report.file.display(),
            format_bytes(report.bytes),
            report.version
        );
        if let Some(stemcell) = &report.stemcell {
            let verb = if stemcell.skipped { "kept" } else { "saved" };
            info!(
                "{verb} stemcell {} ({}, version {})",
                stemcell.file.display(),
                format_bytes(stemcell.bytes),
                stemcell.version
            );
        }
    }
}

fn init_logger(cli: &Cli) {
    use env_logger::Env;
    use log::LevelFilter;

    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    let level = if cli.quiet {
        LevelFilter::Error
    } else if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    builder.filter_level(level);
    if !cli.verbose {
        builder.format_timestamp_secs();
    }
    let _ = builder.try_init();
}
