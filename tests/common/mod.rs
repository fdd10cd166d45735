#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use txroute::application::engine::RouteEngine;
use txroute::application::ledger::Ledger;
use txroute::config::EngineSettings;
use txroute::domain::message::Message;
use txroute::domain::ports::SharedAccountStore;
use txroute::domain::route::{Predicate, Route, Step, TransactionPolicy};
use txroute::infrastructure::channel::ChannelRegistry;
use txroute::infrastructure::in_memory::InMemoryAccountStore;

pub const INCOMING: &str = "transaction.incoming";
pub const OUTGOING: &str = "transaction.outgoing";
pub const DLQ: &str = "DLQ";
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(500);
pub const SHORT_TIMEOUT: Duration = Duration::from_millis(50);

/// Settings with quick retries so failure paths finish fast.
pub fn settings() -> EngineSettings {
    EngineSettings {
        lock_timeout_ms: 1000,
        retry_backoff_ms: 1,
        ..EngineSettings::default()
    }
}

/// Ledger over a fresh in-memory store with `foo=1000` and `bar=1000`.
pub async fn seeded_ledger() -> Ledger {
    seeded_ledger_on(Arc::new(InMemoryAccountStore::new())).await
}

pub async fn seeded_ledger_on(store: SharedAccountStore) -> Ledger {
    let ledger = Ledger::with_lock_timeout(store, settings().lock_timeout());
    ledger.create_account("foo", 1000).await.unwrap();
    ledger.create_account("bar", 1000).await.unwrap();
    ledger
}

pub async fn engine(routes: Vec<Route>) -> RouteEngine {
    engine_with_channels(routes, ChannelRegistry::new()).await
}

pub async fn engine_with_channels(routes: Vec<Route>, channels: ChannelRegistry) -> RouteEngine {
    engine_with_settings(routes, channels, settings()).await
}

pub async fn engine_with_settings(
    routes: Vec<Route>,
    channels: ChannelRegistry,
    settings: EngineSettings,
) -> RouteEngine {
    let ledger = Ledger::with_lock_timeout(
        Arc::new(InMemoryAccountStore::new()),
        settings.lock_timeout(),
    );
    ledger.create_account("foo", 1000).await.unwrap();
    ledger.create_account("bar", 1000).await.unwrap();
    RouteEngine::new(ledger, channels, &settings, routes).unwrap()
}

pub async fn balance(engine: &RouteEngine, account: &str) -> i64 {
    engine.ledger().read(account).await.unwrap().value()
}

pub async fn balances(engine: &RouteEngine) -> (i64, i64) {
    (balance(engine, "foo").await, balance(engine, "bar").await)
}

/// debit foo, credit bar, send to the outgoing channel.
pub fn transfer_steps() -> Vec<Step> {
    vec![
        Step::debit("foo"),
        Step::credit("bar"),
        Step::send_to(OUTGOING),
    ]
}

/// Transfer route consuming from the incoming channel.
pub fn transfer_route(name: &str, policy: TransactionPolicy, steps: Vec<Step>) -> Route {
    Route::new(name, policy, steps).from_channel(INCOMING)
}

/// Throws when the body is the literal text `poison`.
pub fn poison_check() -> Step {
    Step::choice(
        Predicate::BodyEquals {
            value: "poison".into(),
        },
        vec![Step::throw("poison message")],
    )
}

pub fn submit(engine: &RouteEngine, body: impl Into<txroute::domain::message::Body>) {
    engine
        .submit(INCOMING, body, BTreeMap::new())
        .expect("submit failed");
}

pub fn message(body: impl Into<txroute::domain::message::Body>) -> Message {
    Message::new(body)
}
