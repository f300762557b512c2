//! # Order Saga Demo
//!
//! One process playing every role: a dispatcher with a card processor, a
//! correlation registry waiting on command replies, and a saga engine whose
//! published messages travel back through the dispatcher.
//!
//! ```text
//! OrderPlaced ─▶ saga ─publish─▶ PaymentRequested ─▶ PaymentGateway ─send─▶ ChargeCard
//!                  ▲                                      │
//!                  └──────────── PaymentCaptured ◀────────┘ (reply via registry)
//! ```
//!
//! Run with `RUST_LOG=debug` to watch retries and transitions.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use courier_core::{
    impl_event, impl_message, Command, CommandHandler, CorrelationRegistry, Dispatcher,
    EventHandler, IdempotencyStore, RegistryCallback, RemoteBus, RequestEnvelope, Transport,
};
use courier_saga::{
    ActivityChain, InMemorySagaRepository, SagaConfig, SagaDefinition, SagaEngine, SagaError,
    State, TransportPublisher,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: String,
    customer: String,
    amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PaymentRequested {
    order_id: String,
    amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PaymentCaptured {
    order_id: String,
    receipt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PaymentDeadline {
    order_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShipmentRequested {
    order_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShipmentDispatched {
    order_id: String,
    tracking: String,
}

impl_event!(
    OrderPlaced,
    PaymentRequested,
    PaymentCaptured,
    PaymentDeadline,
    ShipmentRequested,
    ShipmentDispatched,
);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChargeCard {
    order_id: String,
    amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Receipt {
    confirmation: String,
}

impl_message!(ChargeCard);

impl Command for ChargeCard {
    type Output = Receipt;
}

// ============================================================================
// Saga
// ============================================================================

const AWAITING_PAYMENT: State = State::new("AwaitingPayment");
const AWAITING_SHIPMENT: State = State::new("AwaitingShipment");

const PAYMENT_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
struct OrderData {
    customer: String,
    amount: u64,
    receipt: Option<String>,
    tracking: Option<String>,
}

fn order_saga() -> Result<SagaDefinition<OrderData>, SagaError> {
    SagaDefinition::builder("order")
        .states([AWAITING_PAYMENT, AWAITING_SHIPMENT])
        .event::<OrderPlaced>(|e| e.order_id.clone())
        .event::<PaymentCaptured>(|e| e.order_id.clone())
        .event::<PaymentDeadline>(|e| e.order_id.clone())
        .event::<ShipmentDispatched>(|e| e.order_id.clone())
        .initially(
            ActivityChain::<OrderPlaced, OrderData>::new()
                .then(|ctx, order| {
                    order.data.customer = ctx.data().customer.clone();
                    order.data.amount = ctx.data().amount;
                })
                .publish(|ctx, order| PaymentRequested {
                    order_id: ctx.correlation_id().to_string(),
                    amount: order.data.amount,
                })
                .schedule(
                    |ctx, _| PaymentDeadline {
                        order_id: ctx.correlation_id().to_string(),
                    },
                    PAYMENT_WINDOW,
                )
                .transition_to(AWAITING_PAYMENT),
        )
        .during(
            AWAITING_PAYMENT,
            ActivityChain::<PaymentCaptured, OrderData>::new()
                .then(|ctx, order| order.data.receipt = Some(ctx.data().receipt.clone()))
                .publish(|ctx, _| ShipmentRequested {
                    order_id: ctx.correlation_id().to_string(),
                })
                .transition_to(AWAITING_SHIPMENT),
        )
        .during(
            AWAITING_SHIPMENT,
            ActivityChain::<ShipmentDispatched, OrderData>::new()
                .then(|ctx, order| order.data.tracking = Some(ctx.data().tracking.clone()))
                .transition_to(State::COMPLETED)
                .finalize(),
        )
        .during_any(
            ActivityChain::<PaymentDeadline, OrderData>::new()
                .filter(|_, order| order.data.receipt.is_none())
                .cancel(),
        )
        .allow_transition(State::INITIAL, AWAITING_PAYMENT)
        .allow_transitions(AWAITING_PAYMENT, [AWAITING_SHIPMENT, State::CANCELLED])
        .allow_transitions(AWAITING_SHIPMENT, [State::COMPLETED, State::CANCELLED])
        .build()
}

// ============================================================================
// Handlers
// ============================================================================

/// Declines anything above its limit.
struct CardProcessor {
    limit: u64,
}

#[async_trait]
impl CommandHandler<ChargeCard> for CardProcessor {
    async fn handle(&self, command: ChargeCard) -> Result<Receipt> {
        anyhow::ensure!(
            command.amount <= self.limit,
            "card declined for {} ({} over limit)",
            command.order_id,
            command.amount - self.limit
        );
        Ok(Receipt {
            confirmation: format!("rcpt-{}", command.order_id),
        })
    }
}

/// Charges the card and reports the capture to the saga.
struct PaymentGateway {
    bus: RemoteBus,
    engine: Arc<SagaEngine<OrderData>>,
}

#[async_trait]
impl EventHandler<PaymentRequested> for PaymentGateway {
    async fn handle(&self, event: &PaymentRequested) -> Result<()> {
        let charge = ChargeCard {
            order_id: event.order_id.clone(),
            amount: event.amount,
        };
        match self.bus.send(&charge).await {
            Ok(receipt) => {
                self.engine
                    .consume(PaymentCaptured {
                        order_id: event.order_id.clone(),
                        receipt: receipt.confirmation,
                    })
                    .await?;
            }
            Err(e) => warn!(order_id = %event.order_id, error = %e, "payment not captured"),
        }
        Ok(())
    }
}

struct Warehouse {
    engine: Arc<SagaEngine<OrderData>>,
}

#[async_trait]
impl EventHandler<ShipmentRequested> for Warehouse {
    async fn handle(&self, event: &ShipmentRequested) -> Result<()> {
        self.engine
            .consume(ShipmentDispatched {
                order_id: event.order_id.clone(),
                tracking: format!("trk-{}", event.order_id),
            })
            .await?;
        Ok(())
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Hands every envelope to the local dispatcher on its own task.
#[derive(Clone)]
struct InProcessTransport {
    dispatcher: Arc<Dispatcher>,
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn send(&self, request: RequestEnvelope) -> Result<()> {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let id = request.id.clone();
            if let Err(e) = dispatcher.dispatch(request).await {
                warn!(%id, error = %e, "dispatch failed");
            }
        });
        Ok(())
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,courier_saga=info,courier_core=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let registry = CorrelationRegistry::default();
    registry.start_sweeper();

    let dispatcher = Arc::new(
        Dispatcher::new(IdempotencyStore::default())
            .with_callback(RegistryCallback::new(registry.clone())),
    );
    let transport = InProcessTransport {
        dispatcher: dispatcher.clone(),
    };

    let engine = SagaEngine::builder(order_saga()?, Arc::new(InMemorySagaRepository::new()))
        .with_publisher(Arc::new(TransportPublisher::new(transport.clone())))
        .with_config(SagaConfig::strict().with_jitter(Duration::from_millis(20)))
        .build();

    let bus = RemoteBus::new(transport, registry.clone())
        .with_callback_url("local://{kind}/replies")
        .with_timeout(Duration::from_secs(1));

    dispatcher.register_command::<ChargeCard, _>(CardProcessor { limit: 1_000 })?;
    dispatcher.subscribe::<PaymentRequested, _>(PaymentGateway {
        bus,
        engine: engine.clone(),
    })?;
    dispatcher.subscribe::<ShipmentRequested, _>(Warehouse {
        engine: engine.clone(),
    })?;

    let orders = [("order-1", 120), ("order-2", 640), ("order-3", 5_000)];
    for (order_id, amount) in orders {
        info!(order_id, amount, "placing order");
        engine
            .consume(OrderPlaced {
                order_id: order_id.to_string(),
                customer: "demo".to_string(),
                amount,
            })
            .await?;
    }

    let counts = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let counts = engine.counts().await?;
            if counts.active == 0 {
                return Ok::<_, SagaError>(counts);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .context("orders did not settle")??;

    for (order_id, _) in orders {
        if let Some(order) = engine.instance(order_id).await? {
            info!(
                order_id,
                customer = %order.data.customer,
                state = %order.current_state,
                receipt = order.data.receipt.as_deref().unwrap_or("-"),
                tracking = order.data.tracking.as_deref().unwrap_or("-"),
                "order settled"
            );
        }
    }
    info!(
        completed = counts.completed,
        cancelled = counts.cancelled,
        "all orders settled"
    );

    registry.shutdown();
    Ok(())
}
