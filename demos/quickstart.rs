//! A minimal example demonstrating the core concepts of event sourcing.
//!
//! Run with: `cargo run --example quickstart`

use eventide::{
    Aggregate, Apply, ApplyOutcome, ApplyReadModel, CancellationToken, DomainEvent,
    EventEnvelope, EventPublisher, Handle, Identity, ProjectionManager, ReadModel,
    ReadModelDefinition, ReadModelProjector, Repository, SourceId, event_set,
    projection::{ReadModelStore, inmemory::Store as ReadModelMemory},
    store::inmemory,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountOpened {
    pub owner: String,
}

impl DomainEvent for AccountOpened {
    const NAME: &'static str = "account.opened";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundsDeposited {
    pub amount: i64,
}

impl DomainEvent for FundsDeposited {
    const NAME: &'static str = "account.deposited";
}

event_set! {
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum AccountEvent {
        Opened(AccountOpened),
        Deposited(FundsDeposited),
    }
}

#[derive(Debug)]
pub struct Deposit {
    pub amount: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("amount must be positive")]
    NonPositive,
}

#[derive(Debug, Default)]
pub struct Account {
    balance: i64,
}

impl Aggregate for Account {
    const KIND: &'static str = "account";
    type Event = AccountEvent;
    type Error = AccountError;

    fn apply(&mut self, event: &AccountEvent) {
        match event {
            AccountEvent::Opened(_) => {}
            AccountEvent::Deposited(e) => Apply::apply(self, e),
        }
    }
}

impl Apply<FundsDeposited> for Account {
    fn apply(&mut self, event: &FundsDeposited) {
        self.balance += event.amount;
    }
}

impl Handle<Deposit> for Account {
    fn handle(&self, cmd: &Deposit) -> Result<Vec<AccountEvent>, AccountError> {
        if cmd.amount <= 0 {
            return Err(AccountError::NonPositive);
        }
        Ok(vec![FundsDeposited { amount: cmd.amount }.into()])
    }
}

#[derive(Clone, Debug, Default)]
pub struct AccountSummary {
    pub owner: String,
    pub total_deposits: i64,
}

impl ReadModel for AccountSummary {
    const KIND: &'static str = "account-summary";
}

impl ApplyReadModel<AccountOpened> for AccountSummary {
    fn apply_event(&mut self, event: &EventEnvelope<AccountOpened>) -> ApplyOutcome {
        self.owner.clone_from(&event.event.owner);
        ApplyOutcome::Modified
    }
}

impl ApplyReadModel<FundsDeposited> for AccountSummary {
    fn apply_event(&mut self, event: &EventEnvelope<FundsDeposited>) -> ApplyOutcome {
        self.total_deposits += event.event.amount;
        ApplyOutcome::Modified
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let summaries = ReadModelMemory::<AccountSummary>::new();
    let definition = ReadModelDefinition::<AccountSummary>::builder()
        .on::<Account, AccountOpened>()
        .on::<Account, FundsDeposited>()
        .build()?;
    let projector = ReadModelProjector::new(definition, summaries.clone());
    let projections = ProjectionManager::new().with_projector(projector);

    let repository = Repository::<Account, _>::new(inmemory::Store::new())?
        .with_publisher(EventPublisher::new().with_subscriber(projections));

    let cancel = CancellationToken::new();
    let id = Identity::new("ACC-001");

    repository
        .update(
            &id,
            &SourceId::new("open-ACC-001"),
            |account| {
                account.emit(AccountOpened {
                    owner: "Ada".into(),
                });
                Ok::<_, AccountError>(())
            },
            &cancel,
        )
        .await?;
    repository
        .execute(&id, &SourceId::new("deposit-1"), &Deposit { amount: 100 }, &cancel)
        .await?;
    // The same source id again is a no-op.
    repository
        .execute(&id, &SourceId::new("deposit-1"), &Deposit { amount: 100 }, &cancel)
        .await?;

    let account = repository.load(&id).await?;
    println!("Balance: {}", account.state().balance);
    assert_eq!(account.state().balance, 100);

    let summary = summaries.get(id.as_str()).await?;
    if let Some(summary) = summary.read_model {
        println!("{} has deposited {}", summary.owner, summary.total_deposits);
        assert_eq!(summary.total_deposits, 100);
    }

    Ok(())
}
