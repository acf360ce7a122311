//! Retry engine behavior against live receivers.

use std::time::Duration;

use herald_dispatch::{
    request::{build_request, Hop, Transformers},
    retry::send_with_retries,
    ClientPool, ConstantBackoff, DispatchError, NoRetry, RetryConfig, SelectiveRetry,
};
use herald_testing::{fixtures, ReceiverResponse, ReceiverServer};
use http::{HeaderMap, StatusCode};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn request(receiver: &ReceiverServer, path: &str) -> reqwest::Request {
    build_request(
        &fixtures::event(),
        &receiver.addressable(path),
        &HeaderMap::new(),
        Hop::Destination,
        Default::default(),
        &Transformers::new(),
    )
    .unwrap()
}

#[tokio::test]
async fn succeeds_after_transient_failures() {
    let receiver = ReceiverServer::start().await;
    receiver.respond_times("/sink", ReceiverResponse::status(503), 2).await;
    receiver.respond("/sink", ReceiverResponse::accepted()).await;

    let pool = ClientPool::new();
    let response = send_with_retries(
        &pool,
        &receiver.addressable("/sink"),
        request(&receiver, "/sink"),
        Some(&RetryConfig::new(5)),
        None,
    )
    .await
    .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    receiver.assert_request_count("/sink", 3).await;
}

#[tokio::test]
async fn last_response_returned_when_retries_run_out() {
    let receiver = ReceiverServer::start().await;
    receiver.respond("/sink", ReceiverResponse::status(500)).await;

    let pool = ClientPool::new();
    let response = send_with_retries(
        &pool,
        &receiver.addressable("/sink"),
        request(&receiver, "/sink"),
        Some(&RetryConfig::new(2)),
        None,
    )
    .await
    .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    receiver.assert_request_count("/sink", 3).await;
}

#[tokio::test]
async fn no_config_sends_once() {
    let receiver = ReceiverServer::start().await;
    receiver.respond("/sink", ReceiverResponse::status(500)).await;

    let pool = ClientPool::new();
    let response =
        send_with_retries(&pool, &receiver.addressable("/sink"), request(&receiver, "/sink"), None, None)
            .await
            .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    receiver.assert_request_count("/sink", 1).await;
}

#[tokio::test]
async fn predicate_decides_what_is_retried() {
    let receiver = ReceiverServer::start().await;
    receiver.respond("/bad-request", ReceiverResponse::status(400)).await;
    receiver.respond("/never", ReceiverResponse::status(503)).await;

    let pool = ClientPool::new();
    let selective = RetryConfig::new(3).with_predicate(SelectiveRetry);
    send_with_retries(
        &pool,
        &receiver.addressable("/bad-request"),
        request(&receiver, "/bad-request"),
        Some(&selective),
        None,
    )
    .await
    .unwrap();
    receiver.assert_request_count("/bad-request", 1).await;

    let never = RetryConfig::new(3).with_predicate(NoRetry);
    send_with_retries(&pool, &receiver.addressable("/never"), request(&receiver, "/never"), Some(&never), None)
        .await
        .unwrap();
    receiver.assert_request_count("/never", 1).await;
}

#[tokio::test]
async fn retry_after_honored_up_to_ceiling() {
    let receiver = ReceiverServer::start().await;
    receiver.respond_times("/sink", ReceiverResponse::status(429).with_retry_after("1"), 1).await;
    receiver.respond("/sink", ReceiverResponse::accepted()).await;

    let pool = ClientPool::new();
    let config = RetryConfig::new(1).with_retry_after_max(Duration::from_secs(5));
    let start = Instant::now();
    let response = send_with_retries(
        &pool,
        &receiver.addressable("/sink"),
        request(&receiver, "/sink"),
        Some(&config),
        None,
    )
    .await
    .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(start.elapsed() >= Duration::from_millis(950), "waited {:?}", start.elapsed());
}

#[tokio::test]
async fn retry_after_ignored_without_ceiling() {
    let receiver = ReceiverServer::start().await;
    receiver.respond_times("/sink", ReceiverResponse::status(503).with_retry_after("30"), 1).await;
    receiver.respond("/sink", ReceiverResponse::accepted()).await;

    let pool = ClientPool::new();
    let config = RetryConfig::new(1).with_backoff(ConstantBackoff(Duration::from_millis(10)));
    let start = Instant::now();
    let response = send_with_retries(
        &pool,
        &receiver.addressable("/sink"),
        request(&receiver, "/sink"),
        Some(&config),
        None,
    )
    .await
    .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(start.elapsed() < Duration::from_secs(5), "waited {:?}", start.elapsed());
}

#[tokio::test]
async fn slow_receiver_times_out_each_attempt() {
    let receiver = ReceiverServer::start().await;
    receiver.respond("/sink", ReceiverResponse::accepted().with_delay(Duration::from_secs(5))).await;

    let pool = ClientPool::new();
    let config = RetryConfig::new(1).with_request_timeout(Duration::from_millis(100));
    let result = send_with_retries(
        &pool,
        &receiver.addressable("/sink"),
        request(&receiver, "/sink"),
        Some(&config),
        None,
    )
    .await;

    assert!(matches!(result, Err(DispatchError::Timeout { .. })));
    receiver.assert_request_count("/sink", 2).await;
}

#[tokio::test]
async fn cancellation_interrupts_backoff() {
    let receiver = ReceiverServer::start().await;
    receiver.respond("/sink", ReceiverResponse::status(500)).await;

    let pool = ClientPool::new();
    let config = RetryConfig::new(3).with_backoff(ConstantBackoff(Duration::from_secs(30)));
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let start = Instant::now();
    let result = send_with_retries(
        &pool,
        &receiver.addressable("/sink"),
        request(&receiver, "/sink"),
        Some(&config),
        Some(&token),
    )
    .await;

    assert!(matches!(result, Err(DispatchError::Cancelled)));
    assert!(start.elapsed() < Duration::from_secs(5));
    receiver.assert_request_count("/sink", 1).await;
}
