/// Integration tests: single HTTP transfers against the reference server.
///
/// Each test spins up `speedprobe-server` on an ephemeral port and watches
/// the events a listener receives.

mod common;

use std::time::Duration;

use common::{Event, assert_no_terminal, recorder, server, silent_server, until_terminal};
use speedprobe::{ComputationMethod, SpeedTestClient, SpeedTestError, SpeedTestMode, UploadStorageType};

const LIMIT: Duration = Duration::from_secs(10);

fn expect_completion(event: Event) -> speedprobe::SpeedTestReport {
    match event {
        Event::Completion(report) => report,
        other => panic!("expected completion, got {other:?}"),
    }
}

fn expect_error(event: Event) -> SpeedTestError {
    match event {
        Event::Error(kind, _) => kind,
        other => panic!("expected error, got {other:?}"),
    }
}

// ── Downloads ───────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn download_counts_every_byte() {
    let addr = server().await;
    let client = SpeedTestClient::new();
    let (listener, mut rx) = recorder();
    client.add_listener(listener);

    client.start_download(&format!("http://{addr}/file/1000000"));
    let (progress, terminal) = until_terminal(&mut rx, LIMIT).await;
    let report = expect_completion(terminal);

    assert_eq!(report.mode(), SpeedTestMode::Download);
    assert_eq!(report.temporary_packet_size(), 1_000_000);
    assert_eq!(report.total_packet_size(), 1_000_000);
    assert_eq!(report.progress_percent(), 100.0);
    assert_eq!(report.request_num(), 1);
    assert_eq!(report.transfer_rate_bit(), report.transfer_rate_octet() * 8.0);
    assert!(report.report_time() >= report.start_time());

    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test(flavor = "multi_thread")]
async fn interval_method_completion_keeps_its_rate() {
    let addr = server().await;
    let client = SpeedTestClient::new();
    client.set_computation_method(ComputationMethod::MedianInterval);
    let (listener, mut rx) = recorder();
    client.add_listener(listener);

    client.start_download(&format!("http://{addr}/file/20000000"));
    let (progress, terminal) = until_terminal(&mut rx, LIMIT).await;
    let report = expect_completion(terminal);

    assert!(progress.len() > 1);
    assert_eq!(report.temporary_packet_size(), 20_000_000);
    assert!(report.transfer_rate_octet() > 0.0, "rate was {}", report.transfer_rate_octet());
    assert_eq!(report.transfer_rate_bit(), report.transfer_rate_octet() * 8.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn redirect_is_followed_to_the_file() {
    let addr = server().await;
    let client = SpeedTestClient::new();
    let (listener, mut rx) = recorder();
    client.add_listener(listener);

    client.start_download(&format!("http://{addr}/redirect/5000"));
    let (_, terminal) = until_terminal(&mut rx, LIMIT).await;
    let report = expect_completion(terminal);

    assert_eq!(report.temporary_packet_size(), 5000);
    assert_eq!(report.request_num(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_content_length_is_inconsistent() {
    let addr = server().await;
    let client = SpeedTestClient::new();
    let (listener, mut rx) = recorder();
    client.add_listener(listener);

    client.start_download(&format!("http://{addr}/chunked/100"));
    let (_, terminal) = until_terminal(&mut rx, LIMIT).await;
    assert_eq!(expect_error(terminal), SpeedTestError::InconsistentContentLength);
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_content_length_is_inconsistent() {
    let addr = server().await;
    let client = SpeedTestClient::new();
    let (listener, mut rx) = recorder();
    client.add_listener(listener);

    client.start_download(&format!("http://{addr}/file/0"));
    let (_, terminal) = until_terminal(&mut rx, LIMIT).await;
    assert_eq!(expect_error(terminal), SpeedTestError::InconsistentContentLength);
}

#[tokio::test(flavor = "multi_thread")]
async fn not_found_is_invalid_response() {
    let addr = server().await;
    let client = SpeedTestClient::new();
    let (listener, mut rx) = recorder();
    client.add_listener(listener);

    client.start_download(&format!("http://{addr}/missing"));
    let (_, terminal) = until_terminal(&mut rx, LIMIT).await;
    assert_eq!(expect_error(terminal), SpeedTestError::InvalidHttpResponse);
}

// ── URI errors ──────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn malformed_uri_is_reported_once() {
    let client = SpeedTestClient::new();
    let (listener, mut rx) = recorder();
    client.add_listener(listener);

    client.start_download("://bad");
    let (_, terminal) = until_terminal(&mut rx, LIMIT).await;
    assert_eq!(expect_error(terminal), SpeedTestError::MalformedUri);
    assert_no_terminal(&mut rx, Duration::from_millis(200)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_scheme_is_unsupported() {
    let client = SpeedTestClient::new();
    let (listener, mut rx) = recorder();
    client.add_listener(listener);

    client.start_download("gopher://127.0.0.1/file");
    let (_, terminal) = until_terminal(&mut rx, LIMIT).await;
    assert_eq!(expect_error(terminal), SpeedTestError::UnsupportedProtocol);
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_connection_is_a_connection_error() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = SpeedTestClient::new();
    let (listener, mut rx) = recorder();
    client.add_listener(listener);

    client.start_download(&format!("http://127.0.0.1:{port}/file/10"));
    let (_, terminal) = until_terminal(&mut rx, LIMIT).await;
    assert_eq!(expect_error(terminal), SpeedTestError::ConnectionError);
}

// ── Uploads ─────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn upload_completes_with_full_payload() {
    let addr = server().await;
    let client = SpeedTestClient::new();
    let (listener, mut rx) = recorder();
    client.add_listener(listener);

    client.start_upload(&format!("http://{addr}/upload"), 300_000);
    let (progress, terminal) = until_terminal(&mut rx, LIMIT).await;
    let report = expect_completion(terminal);

    assert_eq!(report.mode(), SpeedTestMode::Upload);
    assert_eq!(report.temporary_packet_size(), 300_000);
    assert_eq!(report.total_packet_size(), 300_000);
    assert_eq!(report.progress_percent(), 100.0);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_from_file_backed_payload() {
    let addr = server().await;
    let client = SpeedTestClient::new();
    client.set_upload_storage_type(UploadStorageType::File);
    let (listener, mut rx) = recorder();
    client.add_listener(listener);

    client.start_upload(&format!("http://{addr}/upload"), 200_000);
    let (_, terminal) = until_terminal(&mut rx, LIMIT).await;
    let report = expect_completion(terminal);
    assert_eq!(report.temporary_packet_size(), 200_000);
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_redirect_resends_to_new_location() {
    let addr = server().await;
    let client = SpeedTestClient::new();
    let (listener, mut rx) = recorder();
    client.add_listener(listener);

    client.start_upload(&format!("http://{addr}/redirect-upload"), 100_000);
    let (_, terminal) = until_terminal(&mut rx, LIMIT).await;
    let report = expect_completion(terminal);
    assert_eq!(report.temporary_packet_size(), 100_000);
    assert_eq!(report.total_packet_size(), 100_000);
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_redirect_to_https_is_unsupported() {
    let addr = server().await;
    let client = SpeedTestClient::new();
    let (listener, mut rx) = recorder();
    client.add_listener(listener);

    client.start_upload(&format!("http://{addr}/redirect-secure"), 10_000);
    let (_, terminal) = until_terminal(&mut rx, LIMIT).await;
    assert_eq!(expect_error(terminal), SpeedTestError::UnsupportedProtocol);
}

// ── Stopping ────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn force_stop_reports_one_force_close() {
    let addr = silent_server().await;
    let client = SpeedTestClient::new();
    let (listener, mut rx) = recorder();
    client.add_listener(listener);

    client.start_download(&format!("http://{addr}/file/10"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.force_stop_task();
    client.force_stop_task();

    let (_, terminal) = until_terminal(&mut rx, LIMIT).await;
    assert_eq!(expect_error(terminal), SpeedTestError::ForceCloseSocket);
    assert_no_terminal(&mut rx, Duration::from_millis(300)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_peer_hits_socket_timeout() {
    let addr = silent_server().await;
    let client = SpeedTestClient::new();
    client.set_socket_timeout(Duration::from_millis(200));
    let (listener, mut rx) = recorder();
    client.add_listener(listener);

    client.start_download(&format!("http://{addr}/file/10"));
    let (_, terminal) = until_terminal(&mut rx, Duration::from_secs(3)).await;
    assert_eq!(expect_error(terminal), SpeedTestError::SocketTimeout);
}

#[tokio::test(flavor = "multi_thread")]
async fn new_start_supersedes_running_task() {
    let silent = silent_server().await;
    let addr = server().await;
    let client = SpeedTestClient::new();
    let (listener, mut rx) = recorder();
    client.add_listener(listener);

    client.start_download(&format!("http://{silent}/file/10"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.start_download(&format!("http://{addr}/file/2000"));

    let (_, terminal) = until_terminal(&mut rx, LIMIT).await;
    assert_eq!(expect_completion(terminal).temporary_packet_size(), 2000);
    assert_no_terminal(&mut rx, Duration::from_millis(300)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_and_wait_returns_after_stop() {
    let addr = silent_server().await;
    let client = SpeedTestClient::new();
    client.start_download(&format!("http://{addr}/file/10"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.force_stop_task();
    tokio::time::timeout(Duration::from_secs(2), client.shutdown_and_wait())
        .await
        .unwrap();
}

// ── Fixed duration and intervals ────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn fixed_download_completes_at_deadline() {
    let addr = server().await;
    let client = SpeedTestClient::new();
    let (listener, mut rx) = recorder();
    client.add_listener(listener);

    let started = std::time::Instant::now();
    client.start_fixed_download(&format!("http://{addr}/file/100000000000"), Duration::from_millis(300));
    let (_, terminal) = until_terminal(&mut rx, LIMIT).await;
    let report = expect_completion(terminal);

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(report.progress_percent(), 100.0);
    assert!(report.temporary_packet_size() < report.total_packet_size());
    assert!(report.transfer_rate_octet() > 0.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn interval_reports_replace_per_chunk_progress() {
    let addr = server().await;
    let client = SpeedTestClient::new();
    let (listener, mut rx) = recorder();
    client.add_listener(listener);

    client.start_fixed_download_with_interval(
        &format!("http://{addr}/file/100000000000"),
        Duration::from_millis(550),
        Duration::from_millis(100),
    );
    let (progress, terminal) = until_terminal(&mut rx, LIMIT).await;
    expect_completion(terminal);

    assert!(!progress.is_empty());
    assert!(progress.len() <= 10, "got {} progress events", progress.len());
}

#[tokio::test(flavor = "multi_thread")]
async fn live_report_reflects_completed_download() {
    let addr = server().await;
    let client = SpeedTestClient::new();
    let (listener, mut rx) = recorder();
    client.add_listener(listener);

    client.start_download(&format!("http://{addr}/file/4096"));
    let (_, terminal) = until_terminal(&mut rx, LIMIT).await;
    expect_completion(terminal);

    let live = client.get_live_report();
    assert_eq!(live.temporary_packet_size(), 4096);
    assert_eq!(live.progress_percent(), 100.0);
}
