//! Integration tests for read models fed by committed events.

#![cfg(feature = "test-util")]

use std::convert::Infallible;

use eventide::{
    Aggregate, ApplyOutcome, ApplyReadModel, CancellationToken, DomainEvent, EventEnvelope,
    EventPublisher, Identity, ProjectionManager, ReadModel, ReadModelDefinition,
    ReadModelProjector, Repository, SourceId, event_set,
    projection::{ReadModelStore, inmemory::Store as ReadModelStoreInMemory},
    store::{CommittedEvent, inmemory},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Opened {
    owner: String,
}

impl DomainEvent for Opened {
    const NAME: &'static str = "account.opened";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Deposited {
    amount: i64,
}

impl DomainEvent for Deposited {
    const NAME: &'static str = "account.deposited";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Closed;

impl DomainEvent for Closed {
    const NAME: &'static str = "account.closed";
}

event_set! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum AccountEvent {
        Opened(Opened),
        Deposited(Deposited),
        Closed(Closed),
    }
}

#[derive(Debug, Default)]
struct Account;

impl Aggregate for Account {
    const KIND: &'static str = "account";
    type Event = AccountEvent;
    type Error = Infallible;

    fn apply(&mut self, _: &AccountEvent) {}
}

// ============================================================================
// Read models
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Balance {
    owner: String,
    balance: i64,
}

impl ReadModel for Balance {
    const KIND: &'static str = "balance";
}

impl ApplyReadModel<Opened> for Balance {
    fn apply_event(&mut self, event: &EventEnvelope<Opened>) -> ApplyOutcome {
        self.owner.clone_from(&event.event.owner);
        ApplyOutcome::Modified
    }
}

impl ApplyReadModel<Deposited> for Balance {
    fn apply_event(&mut self, event: &EventEnvelope<Deposited>) -> ApplyOutcome {
        if event.event.amount == 0 {
            return ApplyOutcome::Unchanged;
        }
        self.balance += event.event.amount;
        ApplyOutcome::Modified
    }
}

impl ApplyReadModel<Closed> for Balance {
    fn apply_event(&mut self, _: &EventEnvelope<Closed>) -> ApplyOutcome {
        ApplyOutcome::Delete
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Totals {
    deposits: u32,
    amount: i64,
}

impl ReadModel for Totals {
    const KIND: &'static str = "totals";
}

fn balances() -> ReadModelDefinition<Balance> {
    ReadModelDefinition::builder()
        .on::<Account, Opened>()
        .on::<Account, Deposited>()
        .on::<Account, Closed>()
        .build()
        .unwrap()
}

fn totals() -> ReadModelDefinition<Totals> {
    ReadModelDefinition::builder()
        .on_with::<Account, Deposited, _>(|totals: &mut Totals, event: &EventEnvelope<Deposited>| {
            totals.deposits += 1;
            totals.amount += event.event.amount;
            ApplyOutcome::Modified
        })
        .locate_by(|_| vec!["all".to_owned()])
        .build()
        .unwrap()
}

struct Harness {
    log: inmemory::Store,
    repository: Repository<Account, inmemory::Store>,
    balances: ReadModelStoreInMemory<Balance>,
    totals: ReadModelStoreInMemory<Totals>,
}

impl Harness {
    fn new() -> Self {
        let log = inmemory::Store::new();
        let balance_store = ReadModelStoreInMemory::new();
        let totals_store = ReadModelStoreInMemory::new();

        let manager = ProjectionManager::new()
            .with_projector(ReadModelProjector::new(balances(), balance_store.clone()))
            .with_projector(ReadModelProjector::new(totals(), totals_store.clone()));
        let repository = Repository::<Account, _>::new(log.clone())
            .unwrap()
            .with_publisher(EventPublisher::new().with_subscriber(manager));

        Self {
            log,
            repository,
            balances: balance_store,
            totals: totals_store,
        }
    }

    async fn emit(&self, id: &str, events: Vec<AccountEvent>) -> Vec<CommittedEvent> {
        self.repository
            .update(
                &Identity::new(id),
                &SourceId::generate(),
                |root| {
                    for event in events.clone() {
                        root.emit(event);
                    }
                    Ok::<_, Infallible>(())
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn committed_events_reach_every_read_model() {
    let harness = Harness::new();
    harness
        .emit(
            "acc-1",
            vec![
                Opened {
                    owner: "ada".into(),
                }
                .into(),
                Deposited { amount: 10 }.into(),
            ],
        )
        .await;
    harness
        .emit("acc-2", vec![Deposited { amount: 5 }.into()])
        .await;
    harness
        .emit("acc-1", vec![Deposited { amount: 7 }.into()])
        .await;

    let stored = harness.balances.get("acc-1").await.unwrap();
    assert_eq!(
        stored.read_model,
        Some(Balance {
            owner: "ada".into(),
            balance: 17,
        })
    );
    assert_eq!(stored.version, Some(3));

    let totals = harness.totals.get("all").await.unwrap();
    assert_eq!(
        totals.read_model,
        Some(Totals {
            deposits: 3,
            amount: 22,
        })
    );
}

#[tokio::test]
async fn unchanged_read_models_are_not_rewritten() {
    let harness = Harness::new();
    harness
        .emit("acc-1", vec![Deposited { amount: 10 }.into()])
        .await;
    harness
        .emit("acc-1", vec![Deposited { amount: 0 }.into()])
        .await;

    let stored = harness.balances.get("acc-1").await.unwrap();
    assert_eq!(stored.version, Some(1));
}

#[tokio::test]
async fn redelivered_batch_leaves_read_models_untouched() {
    let harness = Harness::new();
    let opened = harness
        .emit(
            "acc-1",
            vec![
                Opened {
                    owner: "ada".into(),
                }
                .into(),
                Deposited { amount: 10 }.into(),
            ],
        )
        .await;
    harness
        .emit("acc-2", vec![Deposited { amount: 5 }.into()])
        .await;

    let replay = ProjectionManager::new()
        .with_projector(ReadModelProjector::new(balances(), harness.balances.clone()))
        .with_projector(ReadModelProjector::new(totals(), harness.totals.clone()));
    let report = replay
        .apply(&opened, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.updated, 0);
    assert_eq!(report.unchanged, 2);
    let stored = harness.balances.get("acc-1").await.unwrap();
    assert_eq!(stored.read_model.map(|b| b.balance), Some(10));
    assert_eq!(stored.version, Some(2));
    assert_eq!(
        harness.totals.get("all").await.unwrap().read_model,
        Some(Totals {
            deposits: 2,
            amount: 15,
        })
    );
}

#[tokio::test]
async fn closing_an_account_deletes_its_balance() {
    let harness = Harness::new();
    harness
        .emit("acc-1", vec![Deposited { amount: 10 }.into()])
        .await;
    harness.emit("acc-1", vec![Closed.into()]).await;

    assert!(!harness.balances.get("acc-1").await.unwrap().exists());
    assert_eq!(
        harness.totals.get("all").await.unwrap().read_model,
        Some(Totals {
            deposits: 1,
            amount: 10,
        })
    );
}

#[tokio::test]
async fn populate_rebuilds_from_the_log() {
    let harness = Harness::new();
    for (id, amount) in [("acc-1", 3), ("acc-2", 4), ("acc-1", 5)] {
        harness
            .emit(id, vec![Deposited { amount }.into()])
            .await;
    }

    let rebuilt = ReadModelStoreInMemory::<Balance>::new();
    let projector = ReadModelProjector::new(balances(), rebuilt.clone());
    let report = projector
        .populate(&harness.log, 2, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.updated, 3);
    let mut expected = harness.balances.all().await;
    let mut actual = rebuilt.all().await;
    expected.sort_by(|a, b| a.0.cmp(&b.0));
    actual.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(actual, expected);

    projector.purge(&CancellationToken::new()).await.unwrap();
    assert!(rebuilt.is_empty().await);
}
