use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use speedprobe::{
    RepeatListener, SpeedTestClient, SpeedTestConfig, SpeedTestError, SpeedTestListener, SpeedTestReport,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

enum Outcome {
    Done(SpeedTestReport),
    Failed(SpeedTestError, String),
}

/// Forwards terminal events to `main` and logs the rest.
struct ChannelListener {
    tx: mpsc::UnboundedSender<Outcome>,
    /// In repeat mode the window listener owns the final result.
    terminal: bool,
}

impl SpeedTestListener for ChannelListener {
    fn on_completion(&self, report: &SpeedTestReport) {
        if self.terminal {
            let _ = self.tx.send(Outcome::Done(report.clone()));
        } else {
            debug!("run {} completed", report.request_num());
        }
    }

    fn on_progress(&self, percent: f32, report: &SpeedTestReport) {
        info!(
            "{:>6.2}%  {:>12.0} bit/s  {}/{} bytes",
            percent,
            report.transfer_rate_bit(),
            report.temporary_packet_size(),
            report.total_packet_size()
        );
    }

    fn on_error(&self, error: SpeedTestError, message: &str) {
        if error.is_force_close() && !self.terminal {
            return;
        }
        let _ = self.tx.send(Outcome::Failed(error, message.to_string()));
    }
}

struct WindowListener {
    tx: mpsc::UnboundedSender<Outcome>,
}

impl RepeatListener for WindowListener {
    fn on_completion(&self, report: &SpeedTestReport) {
        let _ = self.tx.send(Outcome::Done(report.clone()));
    }

    fn on_report(&self, report: &SpeedTestReport) {
        info!(
            "{:>6.2}%  {:>12.0} bit/s  runs={}",
            report.progress_percent(),
            report.transfer_rate_bit(),
            report.request_num()
        );
    }
}

fn env_ms(key: &str) -> anyhow::Result<Option<Duration>> {
    match std::env::var(key) {
        Ok(raw) => {
            let ms: u64 = raw.parse().with_context(|| format!("{key} must be milliseconds"))?;
            Ok(Some(Duration::from_millis(ms)))
        }
        Err(_) => Ok(None),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speedprobe=info,speedprobe_cli=info".into()),
        )
        .init();

    let mode = std::env::var("SPEEDPROBE_MODE").unwrap_or_else(|_| "download".into());
    let uri = std::env::var("SPEEDPROBE_URI").context("SPEEDPROBE_URI is not set")?;
    let upload_size: u64 = std::env::var("SPEEDPROBE_UPLOAD_SIZE")
        .unwrap_or_else(|_| "10000000".into())
        .parse()
        .context("SPEEDPROBE_UPLOAD_SIZE must be a byte count")?;
    let duration = env_ms("SPEEDPROBE_DURATION_MS")?.unwrap_or(Duration::from_secs(10));
    let window = env_ms("SPEEDPROBE_WINDOW_MS")?.unwrap_or(Duration::from_secs(10));
    let interval = env_ms("SPEEDPROBE_REPORT_INTERVAL_MS")?;

    let config = SpeedTestConfig::from_env();
    let socket_timeout = config.socket_timeout;
    let client = SpeedTestClient::with_config(config);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let repeat = mode.starts_with("repeat");
    client.add_listener(Arc::new(ChannelListener {
        tx: tx.clone(),
        terminal: !repeat,
    }));

    info!("{} {}", mode, uri);
    match (mode.as_str(), interval) {
        ("download", None) => client.start_download(&uri),
        ("download", Some(i)) => client.start_download_with_interval(&uri, i),
        ("upload", None) => client.start_upload(&uri, upload_size),
        ("upload", Some(i)) => client.start_upload_with_interval(&uri, upload_size, i),
        ("fixed-download", None) => client.start_fixed_download(&uri, duration),
        ("fixed-download", Some(i)) => client.start_fixed_download_with_interval(&uri, duration, i),
        ("fixed-upload", None) => client.start_fixed_upload(&uri, upload_size, duration),
        ("fixed-upload", Some(i)) => client.start_fixed_upload_with_interval(&uri, upload_size, duration, i),
        ("repeat-download", i) => {
            client.start_download_repeat(&uri, window, i, Arc::new(WindowListener { tx: tx.clone() }))
        }
        ("repeat-upload", i) => client.start_upload_repeat(
            &uri,
            window,
            i,
            upload_size,
            Arc::new(WindowListener { tx: tx.clone() }),
        ),
        (other, _) => bail!("unknown SPEEDPROBE_MODE: {other}"),
    }
    drop(tx);

    let outcome = tokio::select! {
        outcome = rx.recv() => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, stopping transfer");
            client.force_stop_task();
            rx.recv().await
        }
    };
    client.shutdown_and_wait().await;

    match outcome {
        Some(Outcome::Done(report)) => {
            info!(
                "done: {:.0} bit/s ({:.0} B/s), {} bytes, {} request(s)",
                report.transfer_rate_bit(),
                report.transfer_rate_octet(),
                report.temporary_packet_size(),
                report.request_num()
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Some(Outcome::Failed(error, message)) => bail!("{error}: {message}"),
        None => bail!("transfer ended without a result (socket timeout {:?})", socket_timeout),
    }
}
