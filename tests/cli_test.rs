//! End-to-end tests of the `herald` binary against recording receivers.

use std::{path::PathBuf, process::Output};

use herald_core::binding::to_structured_json;
use herald_testing::{fixtures, ReceiverResponse, ReceiverServer};
use tokio::process::Command;

fn event_file(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("herald-{}-{name}.json", std::process::id()));
    std::fs::write(&path, to_structured_json(&fixtures::event()).unwrap()).unwrap();
    path
}

async fn herald(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_herald"))
        .args(args)
        .env("HERALD_CONFIG", "does-not-exist/herald.toml")
        .env("HERALD_BACKOFF_DELAY_MS", "0")
        .env("RUST_LOG", "warn")
        .output()
        .await
        .unwrap()
}

#[tokio::test]
async fn dispatches_event_and_prints_outcome() {
    let receiver = ReceiverServer::start().await;
    receiver
        .respond("/sink", ReceiverResponse::accepted().with_header("x-request-id", "req-7"))
        .await;
    let event = event_file("outcome");
    let destination = receiver.url_for("/sink").to_string();

    let output = herald(&[event.to_str().unwrap(), "--destination", &destination, "-H", "x-trace=abc"]).await;

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("status: 202 Accepted"), "stdout: {stdout}");
    assert!(stdout.contains("header x-request-id: req-7"), "stdout: {stdout}");

    let received = receiver.received_on("/sink").await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].header("x-trace"), Some("abc"));
    assert_eq!(received[0].event().id(), fixtures::event().id());
}

#[tokio::test]
async fn rejected_dispatch_exits_with_failure() {
    let receiver = ReceiverServer::start().await;
    receiver.respond("/sink", ReceiverResponse::status(500)).await;
    let event = event_file("rejected");
    let destination = receiver.url_for("/sink").to_string();

    let output = herald(&[event.to_str().unwrap(), "--destination", &destination]).await;

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("status: 500"));
    receiver.assert_request_count("/sink", 4).await;
}

#[tokio::test]
async fn dead_letter_flag_routes_failed_event() {
    let receiver = ReceiverServer::start().await;
    receiver.respond("/sink", ReceiverResponse::status(400)).await;
    receiver.respond("/dls", ReceiverResponse::accepted()).await;
    let event = event_file("dead-letter");
    let destination = receiver.url_for("/sink").to_string();
    let dead_letter = receiver.url_for("/dls").to_string();

    let output = herald(&[
        event.to_str().unwrap(),
        "--destination",
        &destination,
        "--dead-letter",
        &dead_letter,
        "--structured",
    ])
    .await;

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let dead_lettered = receiver.received_events("/dls").await;
    assert_eq!(dead_lettered.len(), 1);
    assert_eq!(dead_lettered[0].id(), fixtures::event().id());
    assert_eq!(
        receiver.received_on("/dls").await[0].header("content-type"),
        Some("application/cloudevents+json")
    );
}

#[tokio::test]
async fn invalid_event_file_is_reported() {
    let path = std::env::temp_dir().join(format!("herald-{}-invalid.json", std::process::id()));
    std::fs::write(&path, b"{\"id\": 1}").unwrap();

    let output = herald(&[path.to_str().unwrap(), "--destination", "http://127.0.0.1:9/"]).await;

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("is not a valid event"));
}
