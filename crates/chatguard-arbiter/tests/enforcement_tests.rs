//! Enforcement worker: at-most-once reporting per link

mod common;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chatguard_arbiter::{EnforcementOutcome, EnforcementWorker, LogSink, WebhookSink};
use chatguard_broker::{Broker, DedupStore, RecordStore};
use chatguard_core::{
    Decision, DecisionResolution, FinalClassification, RetryPolicy,
};
use chrono::Utc;
use common::{message, FlakyRecords, Pipeline, RecordingSink};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn decision(message_id: &str, violation: bool) -> Decision {
    Decision {
        message_id: message_id.to_string(),
        final_classification: if violation {
            FinalClassification::Violation
        } else {
            FinalClassification::Clean
        },
        combined_reason: "heuristic: forbidden link; llm: advertising".to_string(),
        contributing_stages: BTreeSet::from(["heuristic".to_string(), "llm".to_string()]),
        resolution: DecisionResolution::Complete,
        decided_at: Utc::now(),
    }
}

fn enforcer(pipeline: &Pipeline, sink: Arc<dyn chatguard_arbiter::EnforcementSink>) -> EnforcementWorker {
    EnforcementWorker::new(
        "enforcer-0",
        pipeline.broker.for_consumer("enforcer-0"),
        pipeline.dedup.clone(),
        pipeline.records.clone(),
        sink,
        pipeline.topics.clone(),
        RetryPolicy::fixed(3, Duration::from_millis(5)),
        pipeline.metrics.clone(),
    )
    .with_poll_wait(Duration::from_millis(20))
}

#[tokio::test]
async fn test_violation_reported_exactly_once() {
    let pipeline = Pipeline::new();
    pipeline.records.put_message(&message("M1")).await.unwrap();
    let sink = Arc::new(RecordingSink::new());
    let worker = enforcer(&pipeline, sink.clone());

    let first = worker.enforce(&decision("M1", true)).await.unwrap();
    let second = worker.enforce(&decision("M1", true)).await.unwrap();

    match first {
        EnforcementOutcome::Reported(finding) => {
            assert_eq!(finding.message_link, "https://t.me/c/1001/M1");
            assert_eq!(finding.sender_username, "spammer");
        }
        other => panic!("expected a report, got {:?}", other),
    }
    assert_eq!(second, EnforcementOutcome::Duplicate);
    assert_eq!(sink.calls(), 1);
    assert_eq!(pipeline.records.findings().await.unwrap().len(), 1);
    assert!(pipeline.dedup.is_reported("https://t.me/c/1001/M1").await.unwrap());
    assert_eq!(pipeline.metrics.snapshot().duplicate_reports, 1);
}

#[tokio::test]
async fn test_two_enforcers_share_the_guard() {
    let pipeline = Pipeline::new();
    pipeline.records.put_message(&message("M2")).await.unwrap();
    let sink = Arc::new(RecordingSink::new());
    let a = enforcer(&pipeline, sink.clone());
    let b = enforcer(&pipeline, sink.clone());

    let d = decision("M2", true);
    let (ra, rb) = tokio::join!(a.enforce(&d), b.enforce(&d));
    let outcomes = [ra.unwrap(), rb.unwrap()];

    let reported = outcomes
        .iter()
        .filter(|o| matches!(o, EnforcementOutcome::Reported(_)))
        .count();
    assert_eq!(reported, 1);
    assert_eq!(sink.calls(), 1);
}

#[tokio::test]
async fn test_clean_decision_is_ignored() {
    let pipeline = Pipeline::new();
    pipeline.records.put_message(&message("M3")).await.unwrap();
    let sink = Arc::new(RecordingSink::new());
    let worker = enforcer(&pipeline, sink.clone());

    assert_eq!(
        worker.enforce(&decision("M3", false)).await.unwrap(),
        EnforcementOutcome::Ignored
    );
    assert_eq!(sink.calls(), 0);
    assert!(pipeline.records.findings().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_transient_sink_failures_are_retried() {
    let pipeline = Pipeline::new();
    pipeline.records.put_message(&message("M4")).await.unwrap();
    let sink = Arc::new(RecordingSink::new().failing_first(2));
    let worker = enforcer(&pipeline, sink.clone());

    let outcome = worker.enforce(&decision("M4", true)).await.unwrap();

    assert!(matches!(outcome, EnforcementOutcome::Reported(_)));
    assert_eq!(sink.calls(), 3);
}

#[tokio::test]
async fn test_sink_failure_keeps_the_finding() {
    let pipeline = Pipeline::new();
    pipeline.records.put_message(&message("M5")).await.unwrap();
    let sink = Arc::new(RecordingSink::new().rejecting());
    let worker = enforcer(&pipeline, sink.clone());

    let outcome = worker.enforce(&decision("M5", true)).await.unwrap();
    assert!(matches!(outcome, EnforcementOutcome::SinkFailed(_)));
    assert_eq!(sink.calls(), 1);
    assert_eq!(pipeline.records.findings().await.unwrap().len(), 1);

    // No second attempt toward moderators on redelivery
    assert_eq!(
        worker.enforce(&decision("M5", true)).await.unwrap(),
        EnforcementOutcome::Duplicate
    );
    assert_eq!(sink.calls(), 1);
    assert_eq!(pipeline.metrics.snapshot().enforcement_failures, 1);
}

#[tokio::test]
async fn test_unknown_message_cannot_be_reported() {
    let pipeline = Pipeline::new();
    let worker = enforcer(&pipeline, Arc::new(LogSink));

    assert_eq!(
        worker.enforce(&decision("ghost", true)).await.unwrap(),
        EnforcementOutcome::UnknownMessage
    );
}

#[tokio::test]
async fn test_consumes_decision_topic() {
    let pipeline = Pipeline::new();
    pipeline.records.put_message(&message("M6")).await.unwrap();
    let worker = enforcer(&pipeline, Arc::new(LogSink));

    let payload = serde_json::to_string(&decision("M6", true)).unwrap();
    pipeline
        .broker
        .publish(&pipeline.topics.decisions(), &payload)
        .await
        .unwrap();
    pipeline
        .broker
        .publish(&pipeline.topics.decisions(), "garbage")
        .await
        .unwrap();

    assert!(matches!(
        worker.run_once().await.unwrap(),
        Some(EnforcementOutcome::Reported(_))
    ));
    assert_eq!(worker.run_once().await.unwrap(), Some(EnforcementOutcome::Dropped));
    assert_eq!(worker.run_once().await.unwrap(), None);
    assert_eq!(pipeline.broker.in_flight(), 0);
}

#[tokio::test]
async fn test_store_outage_report_finished_after_restart() {
    let pipeline = Pipeline::new();
    pipeline.records.put_message(&message("M9")).await.unwrap();
    let sink = Arc::new(RecordingSink::new());
    // Longer than the retry budget: the first run gives up
    let records = Arc::new(FlakyRecords::new(pipeline.records.clone(), 3));
    let worker = EnforcementWorker::new(
        "enforcer-0",
        pipeline.broker.for_consumer("enforcer-0"),
        pipeline.dedup.clone(),
        records,
        sink.clone(),
        pipeline.topics.clone(),
        RetryPolicy::fixed(3, Duration::from_millis(5)),
        pipeline.metrics.clone(),
    )
    .with_poll_wait(Duration::from_millis(20));

    let payload = serde_json::to_string(&decision("M9", true)).unwrap();
    pipeline
        .broker
        .publish(&pipeline.topics.decisions(), &payload)
        .await
        .unwrap();

    assert!(worker.run_once().await.is_err());
    assert!(pipeline.dedup.is_reported("https://t.me/c/1001/M9").await.unwrap());
    assert!(pipeline.records.findings().await.unwrap().is_empty());

    // Restart: the decision comes back and the claimed report is completed
    let restarted = enforcer(&pipeline, sink.clone());
    let recovered = pipeline
        .broker
        .for_consumer("enforcer-0")
        .recover(&pipeline.topics.decisions())
        .await
        .unwrap();
    assert_eq!(recovered, 1);
    match restarted.run_once().await.unwrap() {
        Some(EnforcementOutcome::Reported(finding)) => {
            assert_eq!(finding.message_link, "https://t.me/c/1001/M9");
        }
        other => panic!("expected a report, got {:?}", other),
    }
    assert_eq!(pipeline.records.findings().await.unwrap().len(), 1);
    assert_eq!(sink.calls(), 1);
    assert_eq!(pipeline.broker.in_flight(), 0);

    // A fresh copy of the decision is still a duplicate
    pipeline
        .broker
        .publish(&pipeline.topics.decisions(), &payload)
        .await
        .unwrap();
    assert_eq!(restarted.run_once().await.unwrap(), Some(EnforcementOutcome::Duplicate));
    assert_eq!(sink.calls(), 1);
}

#[tokio::test]
async fn test_claimed_link_without_redelivery_stays_duplicate() {
    let pipeline = Pipeline::new();
    pipeline.records.put_message(&message("M10")).await.unwrap();
    let sink = Arc::new(RecordingSink::new());
    let worker = enforcer(&pipeline, sink.clone());

    // Another enforcer holds the claim and has not stored its finding yet
    assert!(pipeline.dedup.try_mark_reported("https://t.me/c/1001/M10").await.unwrap());

    assert_eq!(
        worker.enforce(&decision("M10", true)).await.unwrap(),
        EnforcementOutcome::Duplicate
    );
    assert_eq!(sink.calls(), 0);
    assert!(pipeline.records.findings().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_webhook_sink_posts_finding() {
    let received: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));

    async fn hook(State(received): State<Arc<Mutex<Vec<Value>>>>, Json(body): Json<Value>) -> StatusCode {
        received.lock().unwrap().push(body);
        StatusCode::NO_CONTENT
    }

    let app = Router::new()
        .route("/hook", post(hook))
        .with_state(received.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let pipeline = Pipeline::new();
    pipeline.records.put_message(&message("M7")).await.unwrap();
    let sink = WebhookSink::new(
        reqwest::Client::new(),
        format!("http://{}/hook", addr),
        Duration::from_secs(2),
    );
    let worker = enforcer(&pipeline, Arc::new(sink));

    let outcome = worker.enforce(&decision("M7", true)).await.unwrap();
    assert!(matches!(outcome, EnforcementOutcome::Reported(_)));

    let bodies = received.lock().unwrap().clone();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["finding"]["message_link"], "https://t.me/c/1001/M7");
    assert_eq!(bodies[0]["decision"]["final_classification"], "violation");
}

#[tokio::test]
async fn test_webhook_server_error_is_transient() {
    async fn failing() -> StatusCode {
        StatusCode::SERVICE_UNAVAILABLE
    }

    let app = Router::new().route("/hook", post(failing));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let pipeline = Pipeline::new();
    pipeline.records.put_message(&message("M8")).await.unwrap();
    let sink = WebhookSink::new(
        reqwest::Client::new(),
        format!("http://{}/hook", addr),
        Duration::from_secs(2),
    );
    let worker = enforcer(&pipeline, Arc::new(sink));

    let outcome = worker.enforce(&decision("M8", true)).await.unwrap();
    assert!(matches!(outcome, EnforcementOutcome::SinkFailed(_)));
}
