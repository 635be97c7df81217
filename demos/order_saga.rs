//! Order fulfilment saga
//!
//! An order and a payment aggregate know nothing about each other. The
//! fulfilment saga listens to both and sends commands:
//!
//! - `OrderPlaced` starts a saga instance, which asks for payment.
//! - The command loop below plays the payment service: it handles `Charge`
//!   by recording a `PaymentCaptured` event.
//! - `PaymentCaptured` completes the saga, which asks for shipment.
//!
//! A publish recovery loop runs in the background the whole time; batches
//! whose delivery failed would be handed to the saga again from there.
//!
//! Run with: `RUST_LOG=eventide_core=debug cargo run --example order_saga`

use std::{convert::Infallible, sync::Arc, time::Duration};

use eventide::{
    Aggregate, CancellationToken, DomainEvent, EventPublisher, Identity, Repository, Saga,
    SagaCoordinator, SagaDefinition, SourceId,
    config::EventideConfig,
    event_set,
    recovery::{PublishRecoveryLoop, RepublishRecovery, inmemory::AckLog},
    saga::ChannelCommandBus,
    store::{CommittedEvent, inmemory},
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

// =============================================================================
// Order and payment aggregates
// =============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub total: i64,
}

impl DomainEvent for OrderPlaced {
    const NAME: &'static str = "order.placed";
}

event_set! {
    #[derive(Clone, Debug)]
    pub enum OrderEvent {
        Placed(OrderPlaced),
    }
}

#[derive(Default)]
pub struct Order;

impl Aggregate for Order {
    const KIND: &'static str = "order";
    type Event = OrderEvent;
    type Error = Infallible;

    fn apply(&mut self, _: &OrderEvent) {}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentCaptured {
    pub amount: i64,
}

impl DomainEvent for PaymentCaptured {
    const NAME: &'static str = "payment.captured";
}

event_set! {
    #[derive(Clone, Debug)]
    pub enum PaymentEvent {
        Captured(PaymentCaptured),
    }
}

#[derive(Default)]
pub struct Payment;

impl Aggregate for Payment {
    const KIND: &'static str = "payment";
    type Event = PaymentEvent;
    type Error = Infallible;

    fn apply(&mut self, _: &PaymentEvent) {}
}

// =============================================================================
// Fulfilment saga
// =============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FulfilmentStarted;

impl DomainEvent for FulfilmentStarted {
    const NAME: &'static str = "fulfilment.started";
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentRequested {
    pub amount: i64,
}

impl DomainEvent for PaymentRequested {
    const NAME: &'static str = "fulfilment.payment-requested";
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShipmentRequested;

impl DomainEvent for ShipmentRequested {
    const NAME: &'static str = "fulfilment.shipment-requested";
}

event_set! {
    #[derive(Clone, Debug)]
    pub enum FulfilmentEvent {
        Started(FulfilmentStarted),
        PaymentRequested(PaymentRequested),
        ShipmentRequested(ShipmentRequested),
    }
}

#[derive(Debug)]
pub enum FulfilmentCommand {
    Charge { order: Identity, amount: i64 },
    Ship { order: Identity },
}

#[derive(Debug, thiserror::Error)]
pub enum FulfilmentError {
    #[error("captured {captured} but {due} is due")]
    Underpaid { due: i64, captured: i64 },
}

#[derive(Debug, Default)]
pub struct Fulfilment {
    due: i64,
    shipped: bool,
}

impl Aggregate for Fulfilment {
    const KIND: &'static str = "fulfilment";
    type Event = FulfilmentEvent;
    type Error = FulfilmentError;

    fn apply(&mut self, event: &FulfilmentEvent) {
        match event {
            FulfilmentEvent::Started(_) => {}
            FulfilmentEvent::PaymentRequested(e) => self.due = e.amount,
            FulfilmentEvent::ShipmentRequested(_) => self.shipped = true,
        }
    }
}

impl Saga for Fulfilment {
    type Command = FulfilmentCommand;

    fn started() -> FulfilmentEvent {
        FulfilmentStarted.into()
    }

    fn is_completed(&self) -> bool {
        self.shipped
    }
}

/// Each order's payment lives in its own `payment-<order>` stream.
fn payment_for(order: &Identity) -> Identity {
    Identity::new(format!("payment-{order}"))
}

fn order_of(aggregate_id: &Identity) -> Identity {
    let id = aggregate_id.as_str();
    Identity::new(id.strip_prefix("payment-").unwrap_or(id))
}

/// An order and its payment map to the same saga instance.
fn fulfilment_for(event: &CommittedEvent) -> Option<Identity> {
    Some(Identity::new(format!(
        "fulfilment-{}",
        order_of(&event.aggregate_id)
    )))
}

fn fulfilment() -> Result<SagaDefinition<Fulfilment>, eventide::event::DefinitionError> {
    SagaDefinition::<Fulfilment>::builder(fulfilment_for)
        .started_by::<Order, OrderPlaced, _>(|saga, placed| {
            saga.emit(PaymentRequested {
                amount: placed.event.total,
            });
            saga.publish(FulfilmentCommand::Charge {
                order: placed.aggregate_id.clone(),
                amount: placed.event.total,
            });
            Ok(())
        })
        .handles::<Payment, PaymentCaptured, _>(|saga, captured| {
            let due = saga.state().due;
            if captured.event.amount < due {
                return Err(FulfilmentError::Underpaid {
                    due,
                    captured: captured.event.amount,
                });
            }
            saga.emit(ShipmentRequested);
            saga.publish(FulfilmentCommand::Ship {
                order: order_of(&captured.aggregate_id),
            });
            Ok(())
        })
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = EventideConfig::from_json_str(r#"{ "recovery": { "interval": "200ms" } }"#)?;
    let log = inmemory::Store::new();
    let acks = AckLog::new();
    let shutdown = CancellationToken::new();

    let (bus, mut commands) = ChannelCommandBus::channel();
    let coordinator = Arc::new(SagaCoordinator::new(
        fulfilment()?,
        Repository::new(log.clone())?.with_retry_policy(config.commit_retry),
        bus,
    ));
    let publisher = EventPublisher::new()
        .with_shared_subscriber(coordinator.clone())
        .with_ack_log(acks.clone());

    let orders = Repository::<Order, _>::new(log.clone())?.with_publisher(publisher.clone());
    let payments = Repository::<Payment, _>::new(log.clone())?.with_publisher(publisher.clone());

    let recovery = PublishRecoveryLoop::new(log, acks, RepublishRecovery::new(publisher))
        .with_config(config.recovery);
    let recovery_shutdown = shutdown.clone();
    let recovery_task = tokio::spawn(async move { recovery.run(&recovery_shutdown).await });

    let order = Identity::new("order-17");
    orders
        .update(
            &order,
            &SourceId::new("checkout-17"),
            |root| {
                root.emit(OrderPlaced { total: 4_200 });
                Ok::<_, Infallible>(())
            },
            &shutdown,
        )
        .await?;

    while let Some(command) = commands.recv().await {
        match command {
            FulfilmentCommand::Charge { order, amount } => {
                println!("charging {order}: {amount}");
                payments
                    .update(
                        &payment_for(&order),
                        &SourceId::new(format!("charge-{order}")),
                        |root| {
                            root.emit(PaymentCaptured { amount });
                            Ok::<_, Infallible>(())
                        },
                        &shutdown,
                    )
                    .await?;
            }
            FulfilmentCommand::Ship { order } => {
                println!("shipping {order}");
                break;
            }
        }
    }

    let saga = coordinator
        .repository()
        .load(&Identity::new(format!("fulfilment-{order}")))
        .await?;
    println!("fulfilment is {}", saga.saga_state());

    // Give the recovery loop one pass to verify the acknowledgements.
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();
    recovery_task.await?;

    Ok(())
}
