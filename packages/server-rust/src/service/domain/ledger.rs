//! In-memory ledger: accounts, balances and transfers.
//!
//! Operations:
//! - `ledger.open`     `{ "account", "initial_balance"? }` -> `{ "account", "balance" }`
//! - `ledger.balance`  `{ "account" }` -> `{ "account", "balance" }`
//! - `ledger.transfer` `{ "from", "to", "amount" }` -> `{ "from", "to", "amount", "from_balance", "to_balance" }`
//!
//! A transfer runs as a unit of work (debit, credit, notify) so a failure at
//! any step leaves both balances as they were.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use keel_core::{DomainError, RetryPolicy};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::service::carrier;
use crate::service::executor::ResilientExecutor;
use crate::service::router::{handler_fn, OperationRouter};
use crate::service::unit_of_work::{UnitOfWork, UnitOfWorkCoordinator};

pub const OPEN: &str = "ledger.open";
pub const BALANCE: &str = "ledger.balance";
pub const TRANSFER: &str = "ledger.transfer";

/// Dependency name used for the notifier's breaker and telemetry.
pub const NOTIFIER: &str = "notifier";

type StepFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Account balances in minor currency units.
#[derive(Debug, Default)]
pub struct Ledger {
    accounts: DashMap<String, u64>,
}

impl Ledger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// `Conflict` if the account already exists.
    pub fn open(&self, account: &str, initial_balance: u64) -> Result<(), DomainError> {
        match self.accounts.entry(account.to_string()) {
            Entry::Occupied(_) => Err(DomainError::conflict(format!(
                "account {account} already exists"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(initial_balance);
                Ok(())
            }
        }
    }

    /// # Errors
    ///
    /// `NotFound` if the account does not exist.
    pub fn balance(&self, account: &str) -> Result<u64, DomainError> {
        self.accounts
            .get(account)
            .map(|b| *b)
            .ok_or_else(|| DomainError::not_found("account", account))
    }

    /// Removes `amount`, returning the new balance.
    ///
    /// # Errors
    ///
    /// `NotFound` if the account does not exist, `Conflict` on insufficient funds.
    pub fn debit(&self, account: &str, amount: u64) -> Result<u64, DomainError> {
        let mut balance = self
            .accounts
            .get_mut(account)
            .ok_or_else(|| DomainError::not_found("account", account))?;
        let remaining = balance.checked_sub(amount).ok_or_else(|| {
            DomainError::conflict(format!("insufficient funds in account {account}"))
        })?;
        *balance = remaining;
        Ok(remaining)
    }

    /// Adds `amount`, returning the new balance.
    ///
    /// # Errors
    ///
    /// `NotFound` if the account does not exist, `Conflict` if the balance
    /// would overflow.
    pub fn credit(&self, account: &str, amount: u64) -> Result<u64, DomainError> {
        let mut balance = self
            .accounts
            .get_mut(account)
            .ok_or_else(|| DomainError::not_found("account", account))?;
        let total = balance.checked_add(amount).ok_or_else(|| {
            DomainError::conflict(format!("balance overflow in account {account}"))
        })?;
        *balance = total;
        Ok(total)
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

/// A completed (not yet committed) transfer, as sent to the notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub from: String,
    pub to: String,
    pub amount: u64,
}

/// Downstream dependency told about every transfer before it commits.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, transfer: &Transfer) -> anyhow::Result<()>;
}

/// Notifier that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, transfer: &Transfer) -> anyhow::Result<()> {
        let request_id = carrier::try_current()
            .map(|ctx| ctx.request_id().to_string())
            .unwrap_or_default();
        tracing::info!(
            %request_id,
            from = %transfer.from,
            to = %transfer.to,
            amount = transfer.amount,
            "transfer notification"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LedgerService
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OpenInput {
    account: String,
    #[serde(default)]
    initial_balance: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BalanceInput {
    account: String,
}

/// The ledger's operation handlers.
#[derive(Clone)]
pub struct LedgerService {
    ledger: Arc<Ledger>,
    notifier: Arc<dyn Notifier>,
    executor: Arc<ResilientExecutor>,
    coordinator: Arc<UnitOfWorkCoordinator>,
    notify_policy: RetryPolicy,
}

impl LedgerService {
    #[must_use]
    pub fn new(
        ledger: Arc<Ledger>,
        notifier: Arc<dyn Notifier>,
        executor: Arc<ResilientExecutor>,
        coordinator: Arc<UnitOfWorkCoordinator>,
        notify_policy: RetryPolicy,
    ) -> Self {
        Self {
            ledger,
            notifier,
            executor,
            coordinator,
            notify_policy,
        }
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Registers `ledger.open`, `ledger.balance` and `ledger.transfer`.
    pub fn register(&self, router: &mut OperationRouter) {
        let svc = self.clone();
        router.register(
            OPEN,
            handler_fn(move |input| {
                let svc = svc.clone();
                async move { svc.open(input) }
            }),
        );
        let svc = self.clone();
        router.register(
            BALANCE,
            handler_fn(move |input| {
                let svc = svc.clone();
                async move { svc.balance(input) }
            }),
        );
        let svc = self.clone();
        router.register(
            TRANSFER,
            handler_fn(move |input| {
                let svc = svc.clone();
                async move { svc.transfer(input).await }
            }),
        );
    }

    /// # Errors
    ///
    /// `Validation` on malformed input, `Unauthorized` without an identity,
    /// `Conflict` if the account exists.
    pub fn open(&self, input: Value) -> anyhow::Result<Value> {
        let input: OpenInput = parse(input)?;
        require_identity(OPEN)?;
        validate_account(&input.account)?;
        self.ledger.open(&input.account, input.initial_balance)?;
        Ok(json!({ "account": input.account, "balance": input.initial_balance }))
    }

    /// # Errors
    ///
    /// `Validation` on malformed input, `NotFound` for an unknown account.
    pub fn balance(&self, input: Value) -> anyhow::Result<Value> {
        let input: BalanceInput = parse(input)?;
        let balance = self.ledger.balance(&input.account)?;
        Ok(json!({ "account": input.account, "balance": balance }))
    }

    /// Moves `amount` between two accounts and notifies the notifier.
    ///
    /// # Errors
    ///
    /// `Validation` on malformed input, `Unauthorized` without an identity,
    /// `NotFound`/`Conflict` from the ledger, the notifier's failure once its
    /// retries are exhausted. Balances are unchanged on any error.
    pub async fn transfer(&self, input: Value) -> anyhow::Result<Value> {
        let transfer: Transfer = parse(input)?;
        require_identity(TRANSFER)?;
        if transfer.amount == 0 {
            return Err(DomainError::validation("amount must be greater than zero").into());
        }
        if transfer.from == transfer.to {
            return Err(DomainError::validation("cannot transfer to the same account").into());
        }

        let unit = UnitOfWork::new(TRANSFER)
            .step(
                "debit",
                self.ledger_step(&transfer.from, transfer.amount, Ledger::debit),
                self.ledger_step(&transfer.from, transfer.amount, Ledger::credit),
            )
            .step(
                "credit",
                self.ledger_step(&transfer.to, transfer.amount, Ledger::credit),
                self.ledger_step(&transfer.to, transfer.amount, Ledger::debit),
            )
            .step("notify", self.notify_step(transfer.clone()), || async {
                Ok(())
            });
        self.coordinator.run(unit).await?;

        Ok(json!({
            "from": transfer.from,
            "to": transfer.to,
            "amount": transfer.amount,
            "from_balance": self.ledger.balance(&transfer.from)?,
            "to_balance": self.ledger.balance(&transfer.to)?,
        }))
    }

    fn ledger_step(
        &self,
        account: &str,
        amount: u64,
        apply: fn(&Ledger, &str, u64) -> Result<u64, DomainError>,
    ) -> impl FnOnce() -> std::future::Ready<anyhow::Result<()>> + Send + 'static {
        let ledger = Arc::clone(&self.ledger);
        let account = account.to_string();
        move || std::future::ready(apply(&ledger, &account, amount).map(|_| ()).map_err(Into::into))
    }

    fn notify_step(
        &self,
        transfer: Transfer,
    ) -> impl FnOnce() -> StepFuture + Send + 'static {
        let executor = Arc::clone(&self.executor);
        let notifier = Arc::clone(&self.notifier);
        let policy = self.notify_policy.clone();
        move || {
            Box::pin(async move {
                executor
                    .execute(NOTIFIER, &policy, || {
                        let notifier = Arc::clone(&notifier);
                        let transfer = transfer.clone();
                        async move { notifier.notify(&transfer).await }
                    })
                    .await
            })
        }
    }
}

impl std::fmt::Debug for LedgerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerService")
            .field("ledger", &self.ledger)
            .field("notify_policy", &self.notify_policy)
            .finish_non_exhaustive()
    }
}

fn parse<T: DeserializeOwned>(input: Value) -> Result<T, DomainError> {
    serde_json::from_value(input).map_err(|e| DomainError::validation(format!("invalid input: {e}")))
}

fn validate_account(account: &str) -> Result<(), DomainError> {
    if account.trim().is_empty() {
        return Err(DomainError::validation("account id must not be empty"));
    }
    Ok(())
}

fn require_identity(operation: &str) -> Result<(), DomainError> {
    match carrier::current().identity() {
        Some(_) => Ok(()),
        None => Err(DomainError::unauthorized(format!(
            "{operation} requires an authenticated principal"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use keel_core::{ErrorKind, ManualClock, MemoryAuditSink, MemorySink, Principal, RequestContext};

    use super::*;
    use crate::service::classify::standard_classifier;

    fn service() -> LedgerService {
        let classifier = Arc::new(standard_classifier());
        LedgerService::new(
            Arc::new(Ledger::new()),
            Arc::new(LogNotifier),
            Arc::new(ResilientExecutor::new(classifier, Arc::new(MemorySink::new()))),
            Arc::new(UnitOfWorkCoordinator::new(
                Arc::new(MemoryAuditSink::new()),
                Arc::new(ManualClock::new(0)),
            )),
            RetryPolicy::no_retry(),
        )
    }

    fn signed_in() -> RequestContext {
        RequestContext::new("req-ledger", 0).with_identity(Some(Principal::new("teller")))
    }

    fn kind(err: &anyhow::Error) -> ErrorKind {
        standard_classifier().kind_of(err)
    }

    #[test]
    fn open_debit_credit() {
        let ledger = Ledger::new();
        ledger.open("alice", 100).unwrap();
        assert_eq!(ledger.debit("alice", 30).unwrap(), 70);
        assert_eq!(ledger.credit("alice", 5).unwrap(), 75);
        assert_eq!(ledger.balance("alice").unwrap(), 75);
    }

    #[test]
    fn ledger_rejects_bad_requests() {
        let ledger = Ledger::new();
        ledger.open("alice", 10).unwrap();
        assert!(matches!(ledger.open("alice", 0), Err(DomainError::Conflict(_))));
        assert!(matches!(ledger.debit("alice", 11), Err(DomainError::Conflict(_))));
        assert!(matches!(ledger.balance("bob"), Err(DomainError::NotFound { .. })));
        assert!(matches!(ledger.credit("alice", u64::MAX), Err(DomainError::Conflict(_))));
        assert_eq!(ledger.balance("alice").unwrap(), 10);
    }

    #[tokio::test]
    async fn transfer_moves_funds() {
        let svc = service();
        let out = carrier::with_context(signed_in(), async {
            svc.open(json!({"account": "alice", "initial_balance": 100})).unwrap();
            svc.open(json!({"account": "bob"})).unwrap();
            svc.transfer(json!({"from": "alice", "to": "bob", "amount": 40})).await
        })
        .await
        .unwrap();
        assert_eq!(out["from_balance"], 60);
        assert_eq!(out["to_balance"], 40);
    }

    #[tokio::test]
    async fn insufficient_funds_is_a_conflict_and_changes_nothing() {
        let svc = service();
        let err = carrier::with_context(signed_in(), async {
            svc.open(json!({"account": "alice", "initial_balance": 10})).unwrap();
            svc.open(json!({"account": "bob"})).unwrap();
            svc.transfer(json!({"from": "alice", "to": "bob", "amount": 40})).await
        })
        .await
        .unwrap_err();
        assert_eq!(kind(&err), ErrorKind::Conflict);
        assert_eq!(svc.ledger().balance("alice").unwrap(), 10);
        assert_eq!(svc.ledger().balance("bob").unwrap(), 0);
    }

    #[tokio::test]
    async fn malformed_input_is_a_validation_error() {
        let svc = service();
        let errors = carrier::with_context(signed_in(), async {
            vec![
                svc.transfer(json!({"from": "a", "to": "b"})).await.unwrap_err(),
                svc.transfer(json!({"from": "a", "to": "a", "amount": 1})).await.unwrap_err(),
                svc.transfer(json!({"from": "a", "to": "b", "amount": 0})).await.unwrap_err(),
                svc.open(json!({"account": "  "})).unwrap_err(),
                svc.balance(json!("alice")).unwrap_err(),
            ]
        })
        .await;
        for err in &errors {
            assert_eq!(kind(err), ErrorKind::Validation, "{err:#}");
        }
    }

    #[tokio::test]
    async fn transfer_requires_identity() {
        let svc = service();
        let err = carrier::with_context(RequestContext::new("req-anon", 0), async {
            svc.transfer(json!({"from": "a", "to": "b", "amount": 1})).await
        })
        .await
        .unwrap_err();
        assert_eq!(kind(&err), ErrorKind::Unauthorized);
    }

    #[test]
    fn register_adds_all_operations() {
        let mut router = OperationRouter::new();
        service().register(&mut router);
        assert_eq!(router.names(), vec![BALANCE, OPEN, TRANSFER]);
    }
}
