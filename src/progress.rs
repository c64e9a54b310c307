use std::io::{IsTerminal, Write};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::download::ProgressMode;
use crate::util::format_bytes;

/// Snapshot published by the range downloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub bytes_completed: u64,
    pub total_bytes: u64,
    pub chunks_remaining: usize,
}

#[derive(Debug, Clone, Copy)]
pub enum ProgressFinish {
    Success,
    Failure,
}

pub struct ProgressReporter {
    stop_tx: Option<oneshot::Sender<ProgressFinish>>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn spawn(mode: ProgressMode, events: broadcast::Receiver<ProgressEvent>) -> Option<Self> {
        let renderer: Box<dyn Render + Send> = match mode {
            ProgressMode::Quiet => return None,
            ProgressMode::Text => Box::new(TextRenderer::new()),
            ProgressMode::Json => Box::new(JsonRenderer),
        };
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(render_loop(renderer, events, stop_rx));
        Some(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub async fn finish(mut self, finish: ProgressFinish) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(finish);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn render_loop(
    mut renderer: Box<dyn Render + Send>,
    mut events: broadcast::Receiver<ProgressEvent>,
    mut stop_rx: oneshot::Receiver<ProgressFinish>,
) {
    let start = Instant::now();
    let mut latest: Option<ProgressEvent> = None;
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    latest = Some(event);
                    renderer.render(&ProgressSnapshot::new(event, start), None);
                }
                // slow terminal; the next event carries the totals anyway
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => {
                    let finish = (&mut stop_rx).await.unwrap_or(ProgressFinish::Failure);
                    render_final(renderer.as_mut(), &mut events, latest, start, finish);
                    break;
                }
            },
            result = &mut stop_rx => {
                let finish = result.unwrap_or(ProgressFinish::Failure);
                render_final(renderer.as_mut(), &mut events, latest, start, finish);
                break;
            }
        }
    }
}

fn render_final(
    renderer: &mut (dyn Render + Send),
    events: &mut broadcast::Receiver<ProgressEvent>,
    mut latest: Option<ProgressEvent>,
    start: Instant,
    finish: ProgressFinish,
) {
    loop {
        match events.try_recv() {
            Ok(event) => latest = Some(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    if let Some(event) = latest {
        renderer.render(&ProgressSnapshot::new(event, start), Some(finish));
    }
}

struct ProgressSnapshot {
    downloaded: u64,
    total: u64,
    chunks_remaining: usize,
    elapsed: Duration,
}

impl ProgressSnapshot {
    fn new(event: ProgressEvent, start: Instant) -> Self {
        Self {
            downloaded: event.bytes_completed,
            total: event.total_bytes,
            chunks_remaining: event.chunks_remaining,
            elapsed: start.elapsed(),
        }
    }

    fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.downloaded as f64 / self.total as f64 * 100.0).min(100.0)
    }

    fn throughput(&self) -> f64 {
        let elapsed = self.elapsed.as_secs_f64();
        if elapsed <= f64::EPSILON {
            return 0.0;
        }
        self.downloaded as f64 / elapsed
    }
}

trait Render {
    fn render(&mut self, snapshot: &ProgressSnapshot, finish: Option<ProgressFinish>);
}

struct TextRenderer {
    is_tty: bool,
    last_line_len: usize,
    last_log: Option<Instant>,
}

impl TextRenderer {
    fn new() -> Self {
        Self {
            is_tty: std::io::stderr().is_terminal(),
            last_line_len: 0,
            last_log: None,
        }
    }
}

fn text_line(snapshot: &ProgressSnapshot) -> String {
    let mut parts = vec![
        format!(
            "{} / {}",
            format_bytes(snapshot.downloaded),
            format_bytes(snapshot.total)
        ),
        format!("{:5.1}%", snapshot.percent()),
    ];
    let throughput = snapshot.throughput();
    if throughput > 0.0 {
        parts.push(format!("{}/s", format_bytes(throughput.round() as u64)));
    }
    parts.push(format!("chunks left:{}", snapshot.chunks_remaining));
    parts.join(" | ")
}

impl Render for TextRenderer {
    fn render(&mut self, snapshot: &ProgressSnapshot, finish: Option<ProgressFinish>) {
        let line = text_line(snapshot);
        if self.is_tty {
            let mut to_print = line.clone();
            if self.last_line_len > line.len() {
                to_print.push_str(&" ".repeat(self.last_line_len - line.len()));
            }
            eprint!("\r{to_print}");
            let _ = std::io::stderr().flush();
            self.last_line_len = line.len();
            if finish.is_some() {
                eprintln!();
            }
        } else {
            let now = Instant::now();
            let due = self
                .last_log
                .map_or(true, |prev| now.duration_since(prev) >= Duration::from_secs(1));
            if finish.is_some() || due {
                eprintln!("{line}");
                self.last_log = Some(now);
            }
        }
    }
}

struct JsonRenderer;

impl Render for JsonRenderer {
    fn render(&mut self, snapshot: &ProgressSnapshot, finish: Option<ProgressFinish>) {
        let event = JsonProgressEvent::from_snapshot(snapshot, finish);
        if let Ok(serialized) = serde_json::to_string(&event) {
            println!("{serialized}");
            let _ = std::io::stdout().flush();
        }
    }
}

#[derive(Serialize)]
struct JsonProgressEvent {
    event: &'static str,
    timestamp_ms: u128,
    elapsed_ms: u128,
    bytes_downloaded: u64,
    total_bytes: u64,
    fraction: f64,
    bytes_per_second: f64,
    chunks_remaining: usize,
}

impl JsonProgressEvent {
    fn from_snapshot(snapshot: &ProgressSnapshot, finish: Option<ProgressFinish>) -> Self {
        let event = match finish {
            None => "progress",
            Some(ProgressFinish::Success) => "complete",
            Some(ProgressFinish::Failure) => "failed",
        };
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self {
            event,
            timestamp_ms,
            elapsed_ms: snapshot.elapsed.as_millis(),
            bytes_downloaded: snapshot.downloaded,
            total_bytes: snapshot.total,
            fraction: snapshot.percent() / 100.0,
            bytes_per_second: snapshot.throughput(),
            chunks_remaining: snapshot.chunks_remaining,
        }
    }
}
