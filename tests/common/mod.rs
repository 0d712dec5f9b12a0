//! Shared fixtures for integration tests.
//!
//! A small bank-account aggregate wired to an in-memory store.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use tessera::codec::{decode_json, encode_json};
use tessera::config::{Config, RetryConfig};
use tessera::utils::bootstrap::init_tracing;
use tessera::{
    Aggregate, Decoded, DecodeError, Deletable, DomainEvent, EncodeError, EventStore,
    InMemoryClient, LogEventStore,
};

/// Upper bound for any single wait on a subscription.
pub const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    pub cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountEvent {
    Opened { owner: String },
    Deposited(Amount),
    Withdrawn(Amount),
    Closed,
}

#[derive(Serialize, Deserialize)]
struct OpenedPayload {
    owner: String,
}

impl DomainEvent for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AccountEvent::Opened { .. } => "AccountOpened",
            AccountEvent::Deposited(_) => "MoneyDeposited",
            AccountEvent::Withdrawn(_) => "MoneyWithdrawn",
            AccountEvent::Closed => "AccountClosed",
        }
    }

    fn encode(&self) -> Result<Bytes, EncodeError> {
        match self {
            AccountEvent::Opened { owner } => encode_json(
                self.event_type(),
                &OpenedPayload {
                    owner: owner.clone(),
                },
            ),
            AccountEvent::Deposited(amount) | AccountEvent::Withdrawn(amount) => {
                encode_json(self.event_type(), amount)
            }
            AccountEvent::Closed => encode_json(self.event_type(), &serde_json::json!({})),
        }
    }

    fn decode(event_type: &str, data: &[u8]) -> Decoded<Self> {
        match event_type {
            "AccountOpened" => decode_json::<OpenedPayload>(event_type, data)
                .map(|p| AccountEvent::Opened { owner: p.owner }),
            "MoneyDeposited" => decode_json::<Amount>(event_type, data).map(AccountEvent::Deposited),
            "MoneyWithdrawn" => decode_json::<Amount>(event_type, data).map(AccountEvent::Withdrawn),
            "AccountClosed" => Decoded::Event(AccountEvent::Closed),
            other => Decoded::Error(DecodeError::UnknownType(other.to_string())),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Account {
    pub owner: Option<String>,
    pub balance: i64,
    pub closed: bool,
}

impl Account {
    pub fn withdraw(&self, cents: i64) -> Result<Vec<AccountEvent>, String> {
        if self.closed {
            return Err("account is closed".to_string());
        }
        if cents > self.balance {
            return Err(format!("insufficient funds: {} < {}", self.balance, cents));
        }
        Ok(vec![AccountEvent::Withdrawn(Amount { cents })])
    }
}

impl Aggregate for Account {
    const KIND: &'static str = "account";

    type Event = AccountEvent;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            AccountEvent::Opened { owner } => self.owner = Some(owner.clone()),
            AccountEvent::Deposited(amount) => self.balance += amount.cents,
            AccountEvent::Withdrawn(amount) => self.balance -= amount.cents,
            AccountEvent::Closed => self.closed = true,
        }
    }
}

impl Deletable for Account {
    fn mark_as_deleted(&self) -> Self::Event {
        AccountEvent::Closed
    }
}

pub fn deposit(cents: i64) -> AccountEvent {
    AccountEvent::Deposited(Amount { cents })
}

/// In-memory client plus a store built from a fast-retry configuration.
pub fn setup() -> (Arc<InMemoryClient>, Arc<LogEventStore>, Arc<dyn EventStore>) {
    init_tracing();

    let mut config = Config::default();
    config.retry = RetryConfig {
        min_delay_ms: 1,
        max_delay_ms: 10,
        max_times: 5,
    };

    let client = Arc::new(InMemoryClient::new());
    let store = Arc::new(LogEventStore::from_config(client.clone(), &config));
    let events: Arc<dyn EventStore> = store.clone();
    (client, store, events)
}
