//! A producer, a mailer and a projection over the in-memory adapters.
//!
//! Run with `RUST_LOG=eventline=debug cargo run --example order_pipeline`.

use async_trait::async_trait;
use eventline::{
    decode_json, EventMeta, EventProcessTracking, EventStore, EventStreaming, EventType,
    ExpectedVersion, Flush, HandlerError, HandlerResult, Handles, NewEvent, ProcessName,
    Projection, ProjectorProcess, Reset, SimpleProcess, StoredEvent, StreamName, TrackingConfig,
};
use eventline_memory::{
    InMemoryDeadLetters, InMemoryEventStore, InMemoryMetadataProvider, InMemoryNotificationBus,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct OrderPlaced {
    customer: String,
    cents: u64,
}

impl EventType for OrderPlaced {
    const TYPE_NAME: &'static str = "OrderPlaced";

    fn decode(event: &StoredEvent) -> Result<Self, HandlerError> {
        decode_json(event)
    }
}

/// Sends a confirmation per order.
struct Mailer;

#[async_trait]
impl Handles<OrderPlaced> for Mailer {
    async fn handle(&mut self, event: OrderPlaced, meta: &EventMeta) -> HandlerResult {
        tracing::info!(customer = %event.customer, token = %meta.token, "confirmation sent");
        Ok(())
    }
}

/// Revenue per customer, published on flush.
#[derive(Default)]
struct Revenue {
    pending: BTreeMap<String, u64>,
    published: Arc<Mutex<BTreeMap<String, u64>>>,
}

impl Projection for Revenue {
    fn version(&self) -> &str {
        "1"
    }
}

#[async_trait]
impl Handles<OrderPlaced> for Revenue {
    async fn handle(&mut self, event: OrderPlaced, _meta: &EventMeta) -> HandlerResult {
        *self.pending.entry(event.customer).or_default() += event.cents;
        Ok(())
    }
}

#[async_trait]
impl Handles<Reset> for Revenue {
    async fn handle(&mut self, _event: Reset, _meta: &EventMeta) -> HandlerResult {
        self.pending.clear();
        self.published
            .lock()
            .map_err(|_| HandlerError::fatal("revenue table poisoned"))?
            .clear();
        Ok(())
    }
}

#[async_trait]
impl Handles<Flush> for Revenue {
    async fn handle(&mut self, _event: Flush, _meta: &EventMeta) -> HandlerResult {
        let mut published = self
            .published
            .lock()
            .map_err(|_| HandlerError::fatal("revenue table poisoned"))?;
        for (customer, cents) in std::mem::take(&mut self.pending) {
            *published.entry(customer).or_default() += cents;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let store = InMemoryEventStore::new();
    let provider = InMemoryMetadataProvider::new();
    let streaming = EventStreaming::new(Arc::new(store.clone()))
        .with_notifications(Arc::new(InMemoryNotificationBus::new()))
        .with_dead_letters(Arc::new(InMemoryDeadLetters::new()));
    let tracking = EventProcessTracking::new(TrackingConfig::default());

    let mailer = SimpleProcess::builder(ProcessName::try_new("mailer")?, Mailer)
        .register::<OrderPlaced>()
        .with_tracking(tracking.clone())
        .spawn(streaming.clone(), &provider);
    let revenue = Revenue::default();
    let table = Arc::clone(&revenue.published);
    let projector = ProjectorProcess::builder(ProcessName::try_new("revenue")?, revenue)
        .register::<OrderPlaced>()
        .register::<Reset>()
        .register::<Flush>()
        .with_tracking(tracking.clone())
        .spawn(streaming, &provider);
    mailer.start()?;
    projector.start()?;

    let mut source = tracking.create_tracker();
    for (customer, cents) in [("ada", 1_250), ("grace", 990), ("ada", 310)] {
        let order = OrderPlaced {
            customer: customer.to_owned(),
            cents,
        };
        let stream = StreamName::try_new(format!("orders-{customer}"))?;
        let outcome = store
            .add_to_stream(
                &stream,
                vec![NewEvent::json(OrderPlaced::TYPE_NAME, &order)?],
                ExpectedVersion::Any,
            )
            .await?;
        source.add_tokens(outcome.tokens());
    }
    let id = tracking.commit_to_tracker(source);

    let finished = match tracking.find_tracker(id) {
        Some(tracker) => tracker.wait_for_finish(Duration::from_secs(5)).await,
        None => false,
    };
    tracing::info!(finished, "orders processed");

    // The projector reports progress only after flushing, so the table is current.
    if let Ok(table) = table.lock() {
        for (customer, cents) in table.iter() {
            println!("{customer}: {cents} cents");
        }
    }

    mailer.shutdown().await;
    projector.shutdown().await;
    Ok(())
}
