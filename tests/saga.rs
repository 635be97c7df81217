//! Integration tests for sagas driven by other aggregates' events.

#![cfg(feature = "test-util")]

use std::{convert::Infallible, sync::Arc};

use eventide::{
    Aggregate, CancellationToken, DomainEvent, EventPublisher, Identity, Repository, Saga,
    SagaCoordinator, SagaDefinition, SourceId, event_set,
    recovery::{
        PublishAckLog, PublishRecoveryLoop, RepublishRecovery, VerifyOutcome, inmemory::AckLog,
    },
    saga::{ChannelCommandBus, SagaError, SagaState},
    store::{CommittedEvent, GlobalPosition, inmemory},
    test::RecordingCommandBus,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

// ============================================================================
// Upstream aggregates
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct OrderPlaced {
    items: u32,
}

impl DomainEvent for OrderPlaced {
    const NAME: &'static str = "order.placed";
}

event_set! {
    #[derive(Debug, Clone)]
    enum OrderEvent {
        OrderPlaced(OrderPlaced),
    }
}

#[derive(Default)]
struct Order;

impl Aggregate for Order {
    const KIND: &'static str = "order";
    type Event = OrderEvent;
    type Error = Infallible;

    fn apply(&mut self, _: &OrderEvent) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PaymentReceived {
    amount: i64,
}

impl DomainEvent for PaymentReceived {
    const NAME: &'static str = "payment.received";
}

event_set! {
    #[derive(Debug, Clone)]
    enum PaymentEvent {
        PaymentReceived(PaymentReceived),
    }
}

#[derive(Default)]
struct Payment;

impl Aggregate for Payment {
    const KIND: &'static str = "payment";
    type Event = PaymentEvent;
    type Error = Infallible;

    fn apply(&mut self, _: &PaymentEvent) {}
}

// ============================================================================
// The shipping saga
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ShippingStarted;

impl DomainEvent for ShippingStarted {
    const NAME: &'static str = "shipping.started";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StockRequested {
    items: u32,
}

impl DomainEvent for StockRequested {
    const NAME: &'static str = "shipping.stock-requested";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Shipped;

impl DomainEvent for Shipped {
    const NAME: &'static str = "shipping.shipped";
}

event_set! {
    #[derive(Debug, Clone)]
    enum ShippingEvent {
        ShippingStarted(ShippingStarted),
        StockRequested(StockRequested),
        Shipped(Shipped),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ShippingCommand {
    ReserveStock { order: String, items: u32 },
    Ship { order: String },
}

#[derive(Debug, Error)]
enum ShippingError {
    #[error("payment of {0} does not cover the order")]
    Underpaid(i64),
}

#[derive(Debug, Default)]
struct Shipping {
    items: u32,
    shipped: bool,
}

impl Aggregate for Shipping {
    const KIND: &'static str = "shipping";
    type Event = ShippingEvent;
    type Error = ShippingError;

    fn apply(&mut self, event: &ShippingEvent) {
        match event {
            ShippingEvent::ShippingStarted(_) => {}
            ShippingEvent::StockRequested(e) => self.items = e.items,
            ShippingEvent::Shipped(_) => self.shipped = true,
        }
    }
}

impl Saga for Shipping {
    type Command = ShippingCommand;

    fn started() -> ShippingEvent {
        ShippingStarted.into()
    }

    fn is_completed(&self) -> bool {
        self.shipped
    }
}

const PRICE_PER_ITEM: i64 = 10;

/// Payment streams are named `payment-<order>`; orders use the bare id.
fn order_of(aggregate_id: &Identity) -> &str {
    let id = aggregate_id.as_str();
    id.strip_prefix("payment-").unwrap_or(id)
}

fn payment_id(order: &str) -> Identity {
    Identity::new(format!("payment-{order}"))
}

fn shipping_id(event: &CommittedEvent) -> Option<Identity> {
    Some(Identity::new(format!(
        "shipping-{}",
        order_of(&event.aggregate_id)
    )))
}

fn definition() -> SagaDefinition<Shipping> {
    SagaDefinition::<Shipping>::builder(shipping_id)
        .started_by::<Order, OrderPlaced, _>(|saga, event| {
            saga.emit(StockRequested {
                items: event.event.items,
            });
            saga.publish(ShippingCommand::ReserveStock {
                order: event.aggregate_id.to_string(),
                items: event.event.items,
            });
            Ok(())
        })
        .handles::<Payment, PaymentReceived, _>(|saga, event| {
            let due = i64::from(saga.state().items) * PRICE_PER_ITEM;
            if event.event.amount < due {
                return Err(ShippingError::Underpaid(event.event.amount));
            }
            saga.emit(Shipped);
            saga.publish(ShippingCommand::Ship {
                order: order_of(&event.aggregate_id).to_owned(),
            });
            Ok(())
        })
        .build()
        .unwrap()
}

type Coordinator<B> = SagaCoordinator<Shipping, inmemory::Store, B>;

struct Shop {
    orders: Repository<Order, inmemory::Store>,
    payments: Repository<Payment, inmemory::Store>,
    coordinator: Arc<Coordinator<ChannelCommandBus<ShippingCommand>>>,
    commands: UnboundedReceiver<ShippingCommand>,
}

impl Shop {
    fn new() -> Self {
        let log = inmemory::Store::new();
        let (bus, commands) = ChannelCommandBus::channel();
        let coordinator = Arc::new(SagaCoordinator::new(
            definition(),
            Repository::new(log.clone()).unwrap(),
            bus,
        ));
        let publisher = EventPublisher::new().with_shared_subscriber(coordinator.clone());

        Self {
            orders: Repository::new(log.clone())
                .unwrap()
                .with_publisher(publisher.clone()),
            payments: Repository::new(log).unwrap().with_publisher(publisher),
            coordinator,
            commands,
        }
    }

    async fn place(&self, order: &str, items: u32) -> Vec<CommittedEvent> {
        self.orders
            .update(
                &Identity::new(order),
                &SourceId::generate(),
                |root| {
                    root.emit(OrderPlaced { items });
                    Ok::<_, Infallible>(())
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap()
    }

    async fn pay(&self, order: &str, amount: i64) -> Vec<CommittedEvent> {
        self.payments
            .update(
                &payment_id(order),
                &SourceId::generate(),
                |root| {
                    root.emit(PaymentReceived { amount });
                    Ok::<_, Infallible>(())
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap()
    }

    fn drain(&mut self) -> Vec<ShippingCommand> {
        let mut drained = Vec::new();
        while let Ok(command) = self.commands.try_recv() {
            drained.push(command);
        }
        drained
    }

    async fn state(&self, order: &str) -> SagaState {
        self.coordinator
            .repository()
            .load(&Identity::new(format!("shipping-{order}")))
            .await
            .unwrap()
            .saga_state()
    }
}

#[tokio::test]
async fn order_flows_through_the_saga_to_shipment() {
    let mut shop = Shop::new();

    shop.place("order-1", 3).await;
    assert_eq!(
        shop.drain(),
        vec![ShippingCommand::ReserveStock {
            order: "order-1".into(),
            items: 3,
        }]
    );
    assert_eq!(shop.state("order-1").await, SagaState::Running);

    shop.pay("order-1", 30).await;
    assert_eq!(
        shop.drain(),
        vec![ShippingCommand::Ship {
            order: "order-1".into(),
        }]
    );
    assert_eq!(shop.state("order-1").await, SagaState::Completed);
}

#[tokio::test]
async fn redelivered_events_send_no_further_commands() {
    let mut shop = Shop::new();
    let placed = shop.place("order-1", 1).await;
    shop.drain();

    let report = shop
        .coordinator
        .route(&placed, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.routed, 1);
    assert_eq!(report.commands_published, 0);
    assert!(shop.drain().is_empty());
}

#[tokio::test]
async fn sagas_for_different_orders_are_independent() {
    let mut shop = Shop::new();
    shop.place("order-1", 1).await;
    shop.place("order-2", 2).await;
    shop.pay("order-2", 20).await;
    shop.drain();

    assert_eq!(shop.state("order-1").await, SagaState::Running);
    assert_eq!(shop.state("order-2").await, SagaState::Completed);
}

#[tokio::test]
async fn handler_rejection_leaves_the_saga_untouched() {
    let log = inmemory::Store::new();
    let bus = RecordingCommandBus::new();
    let coordinator =
        SagaCoordinator::new(definition(), Repository::new(log.clone()).unwrap(), bus.clone());
    let orders = Repository::<Order, _>::new(log.clone()).unwrap();
    let payments = Repository::<Payment, _>::new(log).unwrap();
    let cancel = CancellationToken::new();
    let id = Identity::new("order-1");

    let placed = orders
        .update(
            &id,
            &SourceId::generate(),
            |root| {
                root.emit(OrderPlaced { items: 2 });
                Ok::<_, Infallible>(())
            },
            &cancel,
        )
        .await
        .unwrap();
    coordinator.route(&placed, &cancel).await.unwrap();

    let paid = payments
        .update(
            &payment_id("order-1"),
            &SourceId::generate(),
            |root| {
                root.emit(PaymentReceived { amount: 5 });
                Ok::<_, Infallible>(())
            },
            &cancel,
        )
        .await
        .unwrap();
    let err = coordinator.route(&paid, &cancel).await.unwrap_err();

    assert!(matches!(err, SagaError::Domain(ShippingError::Underpaid(5))));
    assert!(err.is_logic_fault());
    let saga = coordinator
        .repository()
        .load(&Identity::new("shipping-order-1"))
        .await
        .unwrap();
    assert_eq!(saga.version(), 2);
    assert_eq!(bus.published().len(), 1);
}

#[tokio::test]
async fn payment_without_an_order_is_an_invalid_state() {
    let log = inmemory::Store::new();
    let coordinator = SagaCoordinator::new(
        definition(),
        Repository::new(log.clone()).unwrap(),
        RecordingCommandBus::new(),
    );
    let paid = Repository::<Payment, _>::new(log)
        .unwrap()
        .update(
            &payment_id("order-9"),
            &SourceId::generate(),
            |root| {
                root.emit(PaymentReceived { amount: 10 });
                Ok::<_, Infallible>(())
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let err = coordinator
        .route(&paid, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SagaError::InvalidState {
            state: SagaState::New,
            ..
        }
    ));
}

#[tokio::test]
async fn undeliverable_payment_does_not_stall_publish_recovery() {
    let log = inmemory::Store::new();
    let acks = AckLog::new();
    let coordinator = Arc::new(SagaCoordinator::new(
        definition(),
        Repository::new(log.clone()).unwrap(),
        RecordingCommandBus::new(),
    ));
    let publisher = EventPublisher::new()
        .with_shared_subscriber(coordinator)
        .with_ack_log(acks.clone());
    let cancel = CancellationToken::new();

    // Committed without publishing, as if the process died after the commit.
    Repository::<Payment, _>::new(log.clone())
        .unwrap()
        .update(
            &payment_id("order-9"),
            &SourceId::generate(),
            |root| {
                root.emit(PaymentReceived { amount: 10 });
                Ok::<_, Infallible>(())
            },
            &cancel,
        )
        .await
        .unwrap();

    let recovery = PublishRecoveryLoop::new(log, acks.clone(), RepublishRecovery::new(publisher));
    assert_eq!(
        recovery.verify_once(&cancel).await.unwrap(),
        VerifyOutcome::RecoveryTriggered { unpublished: 1 }
    );
    assert_eq!(recovery.verify_once(&cancel).await.unwrap(), VerifyOutcome::CaughtUp);
    assert_eq!(acks.verified_cursor().await.unwrap(), GlobalPosition::new(2));
}
