//! Integration tests for the adapter pipeline
//!
//! Each test runs a real [`Adapter`] against in-memory fakes of the RPC
//! service and the sink, with tokio time paused so retry and reconnect
//! backoff elapse instantly.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use common::{deps, eventually, notification, source, source_spec, FakeRpc, FakeSink};
use noobaa_source_controller::adapter::{Adapter, AdapterSettings, AdapterSpec, HealthUpdate};
use noobaa_source_controller::error::Error;

fn drain(rx: &mut mpsc::UnboundedReceiver<HealthUpdate>) -> Vec<bool> {
    let mut seen = Vec::new();
    while let Ok(update) = rx.try_recv() {
        seen.push(update.is_bad);
    }
    seen
}

fn adapter(
    spec: &noobaa_source_controller::crd::NooBaaSourceSpec,
    rpc: Arc<FakeRpc>,
    sink: Arc<FakeSink>,
) -> (Adapter, mpsc::UnboundedReceiver<HealthUpdate>) {
    adapter_with(spec, rpc, sink, AdapterSettings::default())
}

fn adapter_with(
    spec: &noobaa_source_controller::crd::NooBaaSourceSpec,
    rpc: Arc<FakeRpc>,
    sink: Arc<FakeSink>,
    settings: AdapterSettings,
) -> (Adapter, mpsc::UnboundedReceiver<HealthUpdate>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let resource = source("src", 1, spec.clone());
    let adapter = Adapter::new(AdapterSpec::from_resource(&resource), deps(rpc, sink), settings, tx);
    (adapter, rx)
}

#[tokio::test(start_paused = true)]
async fn notification_becomes_event_at_sink() {
    let rpc = FakeRpc::new("token");
    rpc.push(notification("o1"));
    let sink = FakeSink::new();
    let (adapter, mut health) = adapter(&source_spec("b1", "token", "http://sink/x"), rpc.clone(), sink.clone());

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(adapter.run(cancel.clone()));

    eventually(|| sink.delivered().len() == 1).await;
    let (uri, event) = &sink.delivered()[0];
    assert_eq!(uri, "http://sink/x");
    assert_eq!(event.subject.as_deref(), Some("o1"));
    assert_eq!(event.source, "noobaa://buckets/b1");
    assert_eq!(event.type_, "io.noobaa.bucket.object.notification");

    cancel.cancel();
    assert!(handle.await.unwrap().is_ok());
    assert_eq!(drain(&mut health), vec![false]);
    assert_eq!(rpc.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_sink_failures_are_retried_without_unhealthy_transition() {
    let rpc = FakeRpc::new("token");
    rpc.push(notification("o1"));
    let sink = FakeSink::scripted(vec![
        Err(Error::transient_delivery("500")),
        Err(Error::transient_delivery("500")),
        Err(Error::transient_delivery("500")),
        Ok(()),
    ]);
    let (adapter, mut health) = adapter(&source_spec("b1", "token", "http://sink/x"), rpc, sink.clone());

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(adapter.run(cancel.clone()));

    eventually(|| sink.delivered().len() == 1).await;
    assert_eq!(sink.attempts(), 4);

    cancel.cancel();
    handle.await.unwrap().unwrap();
    assert_eq!(drain(&mut health), vec![false]);
}

#[tokio::test(start_paused = true)]
async fn permanent_sink_failure_is_not_retried() {
    let rpc = FakeRpc::new("token");
    rpc.push(notification("o1"));
    rpc.push(notification("o2"));
    let sink = FakeSink::scripted(vec![Err(Error::permanent_delivery("400"))]);
    let (adapter, _health) = adapter(&source_spec("b1", "token", "http://sink/x"), rpc, sink.clone());

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(adapter.run(cancel.clone()));

    eventually(|| sink.delivered().len() == 1).await;
    assert_eq!(sink.attempts(), 2);
    assert_eq!(sink.delivered()[0].1.subject.as_deref(), Some("o2"));

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn wrong_secret_reports_unhealthy_once() {
    let rpc = FakeRpc::new("right");
    let sink = FakeSink::new();
    let (adapter, mut health) = adapter(&source_spec("b1", "wrong", "http://sink/x"), rpc.clone(), sink);

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(adapter.run(cancel.clone()));

    eventually(|| rpc.connects() >= 5).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(drain(&mut health), vec![true]);
    assert_eq!(rpc.closes(), 0);
}

#[tokio::test(start_paused = true)]
async fn lost_subscription_reconnects_and_resumes_in_order() {
    let rpc = FakeRpc::new("token");
    for key in ["n1", "n2", "n3"] {
        rpc.push(notification(key));
    }
    rpc.lose_connection_after(2);
    let sink = FakeSink::new();
    let (adapter, mut health) = adapter(&source_spec("b1", "token", "http://sink/x"), rpc.clone(), sink.clone());

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(adapter.run(cancel.clone()));

    eventually(|| sink.delivered().len() == 3).await;
    let subjects: Vec<_> = sink
        .delivered()
        .iter()
        .map(|(_, event)| event.subject.clone().unwrap_or_default())
        .collect();
    assert_eq!(subjects, vec!["n1", "n2", "n3"]);
    assert_eq!(rpc.connects(), 2);

    cancel.cancel();
    handle.await.unwrap().unwrap();
    assert_eq!(drain(&mut health), vec![false, true, false]);
    assert_eq!(rpc.closes(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancellation_between_retries_does_not_count_as_failure() {
    let rpc = FakeRpc::new("token");
    rpc.push(notification("n1"));
    let sink = FakeSink::scripted(vec![Err(Error::transient_delivery("503"))]);
    // a single counted failure would flip health to bad
    let settings = AdapterSettings {
        failure_threshold: 1,
        ..AdapterSettings::default()
    };
    let (adapter, mut health) =
        adapter_with(&source_spec("b1", "token", "http://sink/x"), rpc, sink.clone(), settings);

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(adapter.run(cancel.clone()));

    eventually(|| sink.attempts() == 1).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert!(sink.delivered().is_empty());
    assert_eq!(sink.attempts(), 1);
    assert_eq!(drain(&mut health), vec![false]);
}

#[tokio::test(start_paused = true)]
async fn deliveries_are_sequential_and_ordered() {
    let rpc = FakeRpc::new("token");
    for key in ["n1", "n2", "n3"] {
        rpc.push(notification(key));
    }
    let sink = FakeSink::new().with_delay(Duration::from_millis(50));
    let (adapter, _health) = adapter(&source_spec("b1", "token", "http://sink/x"), rpc, sink.clone());

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(adapter.run(cancel.clone()));

    eventually(|| sink.delivered().len() == 3).await;
    assert_eq!(
        sink.log(),
        vec!["start:n1", "end:n1", "start:n2", "end:n2", "start:n3", "end:n3"]
    );

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn cancellation_finishes_in_flight_delivery_and_stops() {
    let rpc = FakeRpc::new("token");
    rpc.push(notification("n1"));
    rpc.push(notification("n2"));
    let sink = FakeSink::new().with_delay(Duration::from_secs(1));
    let (adapter, _health) = adapter(&source_spec("b1", "token", "http://sink/x"), rpc.clone(), sink.clone());

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(adapter.run(cancel.clone()));

    eventually(|| sink.log() == vec!["start:n1"]).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(sink.log(), vec!["start:n1", "end:n1"]);
    assert_eq!(rpc.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn unresolvable_sink_fails_start() {
    let rpc = FakeRpc::new("token");
    let sink = FakeSink::new();
    let mut spec = source_spec("b1", "token", "http://sink/x");
    spec.sink.uri = None;
    let (adapter, _health) = adapter(&spec, rpc.clone(), sink);

    let result = adapter.run(CancellationToken::new()).await;
    assert!(matches!(result, Err(Error::UnresolvedSink(_))));
    assert_eq!(rpc.connects(), 0);
}
