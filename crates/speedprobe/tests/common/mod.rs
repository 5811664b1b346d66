//! Shared fixtures for the integration tests: a channel-backed listener and
//! a reference server on an ephemeral port.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use speedprobe::{RepeatListener, SpeedTestError, SpeedTestListener, SpeedTestReport};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum Event {
    Progress(f32, SpeedTestReport),
    Completion(SpeedTestReport),
    Error(SpeedTestError, String),
}

pub struct Recorder {
    tx: mpsc::UnboundedSender<Event>,
}

impl SpeedTestListener for Recorder {
    fn on_completion(&self, report: &SpeedTestReport) {
        let _ = self.tx.send(Event::Completion(report.clone()));
    }

    fn on_progress(&self, percent: f32, report: &SpeedTestReport) {
        let _ = self.tx.send(Event::Progress(percent, report.clone()));
    }

    fn on_error(&self, error: SpeedTestError, message: &str) {
        let _ = self.tx.send(Event::Error(error, message.to_string()));
    }
}

pub fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder { tx }), rx)
}

#[derive(Debug)]
pub enum WindowEvent {
    Report(SpeedTestReport),
    Completion(SpeedTestReport),
}

pub struct WindowRecorder {
    tx: mpsc::UnboundedSender<WindowEvent>,
}

impl RepeatListener for WindowRecorder {
    fn on_completion(&self, report: &SpeedTestReport) {
        let _ = self.tx.send(WindowEvent::Completion(report.clone()));
    }

    fn on_report(&self, report: &SpeedTestReport) {
        let _ = self.tx.send(WindowEvent::Report(report.clone()));
    }
}

pub fn window_recorder() -> (Arc<WindowRecorder>, mpsc::UnboundedReceiver<WindowEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(WindowRecorder { tx }), rx)
}

pub async fn server() -> SocketAddr {
    speedprobe_server::spawn("127.0.0.1:0".parse().unwrap()).await.unwrap()
}

/// A peer that accepts connections and never writes a byte.
pub async fn silent_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

/// Collects progress percentages until the first completion or error.
pub async fn until_terminal(rx: &mut mpsc::UnboundedReceiver<Event>, limit: Duration) -> (Vec<f32>, Event) {
    let mut progress = Vec::new();
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("no terminal event before the deadline")
            .expect("listener channel closed");
        match event {
            Event::Progress(p, _) => progress.push(p),
            other => return (progress, other),
        }
    }
}

/// Asserts that nothing but progress arrives within `quiet`.
pub async fn assert_no_terminal(rx: &mut mpsc::UnboundedReceiver<Event>, quiet: Duration) {
    let deadline = tokio::time::Instant::now() + quiet;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        if !matches!(event, Event::Progress(..)) {
            panic!("unexpected event: {event:?}");
        }
    }
}
