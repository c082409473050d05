//! End-to-end runs of the full stack: wrapper, pipeline, ledger, unit of
//! work, executor and breaker, with in-memory audit and telemetry.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::{
    AuditOutcome, BreakerConfig, ErrorKind, ManualClock, MemoryAuditSink, MemorySink, Principal,
    RetryPolicy, TelemetryEvent, INTERNAL_PUBLIC_MESSAGE,
};
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::breaker::BreakerRegistry;
use super::classify::standard_classifier;
use super::config::ServerConfig;
use super::domain::ledger::{self, Ledger, LedgerService, Notifier, Transfer};
use super::executor::ResilientExecutor;
use super::middleware::build_operation_pipeline;
use super::operation::{OperationRequest, ResponseEnvelope, TransportMetadata};
use super::router::{handler_fn, OperationRouter};
use super::unit_of_work::{UnitOfWork, UnitOfWorkCoordinator};
use super::wrapper::OperationWrapper;

/// Notifier that fails a set number of times, optionally after a delay.
#[derive(Default)]
struct ScriptedNotifier {
    failures: AtomicU32,
    delay: Duration,
    calls: AtomicU32,
}

impl ScriptedNotifier {
    fn failing(times: u32) -> Self {
        Self {
            failures: AtomicU32::new(times),
            ..Self::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Notifier for ScriptedNotifier {
    async fn notify(&self, _transfer: &Transfer) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(keel_core::DomainError::dependency(ledger::NOTIFIER, "connection reset").into());
        }
        Ok(())
    }
}

struct Harness {
    wrapper: OperationWrapper,
    ledger: Arc<Ledger>,
    audit: Arc<MemoryAuditSink>,
    telemetry: Arc<MemorySink>,
    notifier: Arc<ScriptedNotifier>,
}

impl Harness {
    fn new(notifier: ScriptedNotifier) -> Self {
        let classifier = Arc::new(standard_classifier());
        let telemetry = Arc::new(MemorySink::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let notifier = Arc::new(notifier);
        let ledger = Arc::new(Ledger::new());

        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default(), telemetry.clone()));
        let executor = Arc::new(
            ResilientExecutor::new(Arc::clone(&classifier), telemetry.clone()).with_breakers(breakers),
        );
        let coordinator = Arc::new(UnitOfWorkCoordinator::new(audit.clone(), clock.clone()));
        let policy = RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(20))
            .expect("valid policy");
        let service = LedgerService::new(
            Arc::clone(&ledger),
            notifier.clone(),
            executor,
            coordinator,
            policy,
        );

        let mut router = OperationRouter::new();
        service.register(&mut router);
        let pipeline = build_operation_pipeline(router, &ServerConfig::default());
        let wrapper = OperationWrapper::new(pipeline, classifier, telemetry.clone(), clock);

        ledger.open("alice", 100).expect("open alice");
        ledger.open("bob", 0).expect("open bob");

        Self {
            wrapper,
            ledger,
            audit,
            telemetry,
            notifier,
        }
    }

    async fn transfer(&self, input: Value, timeout_ms: Option<u64>) -> ResponseEnvelope {
        let metadata = TransportMetadata {
            identity: Some(Principal::new("teller-1")),
            request_id: Some("req-scenario".to_string()),
            trace_id: None,
            timeout_ms,
        };
        self.wrapper
            .handle(OperationRequest::new(ledger::TRANSFER, input).with_metadata(metadata))
            .await
    }

    fn balances(&self) -> (u64, u64) {
        (
            self.ledger.balance("alice").expect("alice"),
            self.ledger.balance("bob").expect("bob"),
        )
    }
}

#[tokio::test]
async fn a_successful_transfer_commits_and_audits_once() {
    let h = Harness::new(ScriptedNotifier::default());
    let env = h
        .transfer(json!({"from": "alice", "to": "bob", "amount": 25}), None)
        .await;

    assert_eq!(env.status, 200);
    assert!(env.body.success);
    assert_eq!(env.body.data.as_ref().unwrap()["from_balance"], 75);
    assert_eq!(h.balances(), (75, 25));

    let events = h.audit.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, AuditOutcome::Committed);
    assert_eq!(events[0].actor.as_deref(), Some("teller-1"));
    assert_eq!(events[0].request_id, "req-scenario");
    assert_eq!(events[0].operation_name, ledger::TRANSFER);
    assert_eq!(h.telemetry.calls().len(), 1);
}

#[tokio::test]
async fn b_transient_dependency_failures_are_retried() {
    let h = Harness::new(ScriptedNotifier::failing(2));
    let env = h
        .transfer(json!({"from": "alice", "to": "bob", "amount": 10}), None)
        .await;

    assert_eq!(env.status, 200);
    assert_eq!(h.notifier.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.telemetry.retry_count(), 2);
    assert_eq!(h.balances(), (90, 10));

    match &h.telemetry.calls()[0] {
        TelemetryEvent::Call { retries, status, .. } => {
            assert_eq!(*retries, 2);
            assert_eq!(*status, 200);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(h.audit.events()[0].outcome, AuditOutcome::Committed);
}

#[tokio::test]
async fn c_failed_step_rolls_back_earlier_steps() {
    let h = Harness::new(ScriptedNotifier::default());
    // The debit succeeds, the credit fails: the debit is compensated and the
    // notifier never runs.
    let env = h
        .transfer(json!({"from": "alice", "to": "carol", "amount": 30}), None)
        .await;

    assert_eq!(env.status, 404);
    let error = env.body.error.unwrap();
    assert_eq!(error.kind, ErrorKind::NotFound);
    assert_eq!(error.message, "account not found: carol");
    assert_eq!(h.ledger.balance("alice").unwrap(), 100);
    assert_eq!(h.notifier.calls.load(Ordering::SeqCst), 0);

    let events = h.audit.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, AuditOutcome::RolledBack);
    assert_eq!(events[0].failed_step.as_deref(), Some("credit"));
}

#[tokio::test]
async fn c_exhausted_dependency_rolls_back_both_ledger_steps() {
    let h = Harness::new(ScriptedNotifier::failing(10));
    let env = h
        .transfer(json!({"from": "alice", "to": "bob", "amount": 30}), None)
        .await;

    assert_eq!(env.status, 502);
    assert!(env.body.error.unwrap().kind.is_retryable());
    assert_eq!(h.notifier.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.balances(), (100, 0));
    assert_eq!(h.audit.events()[0].failed_step.as_deref(), Some("notify"));
}

#[tokio::test]
async fn d_expired_deadline_returns_a_generic_internal_error() {
    let h = Harness::new(ScriptedNotifier::slow(Duration::from_secs(5)));
    let env = h
        .transfer(json!({"from": "alice", "to": "bob", "amount": 5}), Some(50))
        .await;

    assert_eq!(env.status, 500);
    let error = env.body.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Internal);
    assert_eq!(error.message, INTERNAL_PUBLIC_MESSAGE);
    assert_eq!(h.telemetry.calls().len(), 1);

    // The unit was rolled back and audited before the response was produced.
    assert_eq!(h.balances(), (100, 0));
    let events = h.audit.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, AuditOutcome::RolledBack);
    assert_eq!(events[0].failed_step.as_deref(), Some("notify"));
}

/// Wrapper whose `test.unit` operation runs a two-step unit: step "one"
/// records itself, step "two" takes `second_step` to finish.
fn unit_wrapper(second_step: Duration) -> (OperationWrapper, Arc<MemoryAuditSink>, Arc<Mutex<Vec<String>>>) {
    let audit = Arc::new(MemoryAuditSink::new());
    let coordinator = Arc::new(UnitOfWorkCoordinator::new(
        audit.clone(),
        Arc::new(ManualClock::new(0)),
    ));
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut router = OperationRouter::new();
    let handler_log = Arc::clone(&log);
    router.register(
        "test.unit",
        handler_fn(move |_input: Value| {
            let coordinator = Arc::clone(&coordinator);
            let log = Arc::clone(&handler_log);
            async move {
                let (apply, undo) = (Arc::clone(&log), Arc::clone(&log));
                let unit = UnitOfWork::new("test.unit")
                    .step(
                        "one",
                        move || async move {
                            apply.lock().push("do one".to_string());
                            Ok(())
                        },
                        move || async move {
                            undo.lock().push("undo one".to_string());
                            Ok(())
                        },
                    )
                    .step(
                        "two",
                        move || async move {
                            tokio::time::sleep(second_step).await;
                            Ok(())
                        },
                        || async { Ok(()) },
                    );
                coordinator.run(unit).await?;
                Ok(Value::Null)
            }
        }),
    );
    let wrapper = OperationWrapper::new(
        build_operation_pipeline(router, &ServerConfig::default()),
        Arc::new(standard_classifier()),
        Arc::new(MemorySink::new()),
        Arc::new(ManualClock::new(0)),
    );
    (wrapper, audit, log)
}

fn unit_request(timeout_ms: Option<u64>) -> OperationRequest {
    OperationRequest::new("test.unit", Value::Null).with_metadata(TransportMetadata {
        request_id: Some("req-unit".to_string()),
        timeout_ms,
        ..TransportMetadata::default()
    })
}

#[tokio::test]
async fn d_deadline_mid_unit_compensates_before_responding() {
    let (wrapper, audit, log) = unit_wrapper(Duration::from_secs(5));
    let env = wrapper.handle(unit_request(Some(50))).await;

    assert_eq!(env.status, 500);
    assert_eq!(*log.lock(), vec!["do one", "undo one"]);
    let events = audit.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, AuditOutcome::RolledBack);
    assert_eq!(events[0].failed_step.as_deref(), Some("two"));
}

#[tokio::test]
async fn abandoned_call_still_finishes_its_unit() {
    let (wrapper, audit, log) = unit_wrapper(Duration::from_millis(60));
    let abandoned =
        tokio::time::timeout(Duration::from_millis(20), wrapper.handle(unit_request(None))).await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(*log.lock(), vec!["do one"]);
    let events = audit.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, AuditOutcome::Committed);
}
