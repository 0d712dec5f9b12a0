//! Read models built from category subscriptions.

use std::collections::HashMap;

use tessera::{AggregateRoot, DeleteMode, Repository, Selector};

use crate::common::{deposit, setup, Account, AccountEvent, WAIT};

async fn open(repo: &Repository<Account, String>, id: &str, cents: i64) {
    let mut account = AggregateRoot::new(id.to_string());
    account.raise(AccountEvent::Opened {
        owner: id.to_string(),
    });
    account.raise(deposit(cents));
    repo.add(&mut account).await.unwrap();
}

fn project(balances: &mut HashMap<String, i64>, stream: &str, event: &AccountEvent) {
    let balance = balances.entry(stream.to_string()).or_default();
    match event {
        AccountEvent::Deposited(amount) => *balance += amount.cents,
        AccountEvent::Withdrawn(amount) => *balance -= amount.cents,
        AccountEvent::Opened { .. } | AccountEvent::Closed => {}
    }
}

#[tokio::test]
async fn test_catch_up_projection_over_category() {
    let (_, store, events) = setup();
    let repo: Repository<Account, String> =
        Repository::new(events).with_delete_mode(DeleteMode::Hard);

    open(&repo, "a", 100).await;
    open(&repo, "b", 250).await;

    let mut subscription = store
        .observe::<AccountEvent>(Selector::category("account"), None, None)
        .await
        .unwrap()
        .into_catch_up()
        .unwrap();

    let mut balances = HashMap::new();
    for _ in 0..4 {
        let record = tokio::time::timeout(WAIT, subscription.recv())
            .await
            .unwrap()
            .unwrap();
        project(&mut balances, &record.stream_name, &record.data);
    }
    assert_eq!(balances.get("account-a"), Some(&100));
    assert_eq!(balances.get("account-b"), Some(&250));

    // The tombstone lands in the category but is never emitted
    repo.remove(&"a".to_string()).await.unwrap();
    open(&repo, "c", 75).await;
    for _ in 0..2 {
        let record = tokio::time::timeout(WAIT, subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.stream_name, "account-c");
        project(&mut balances, &record.stream_name, &record.data);
    }
    assert_eq!(balances.get("account-c"), Some(&75));

    subscription.close().await;
}

#[tokio::test]
async fn test_consumer_group_projection_acks_everything() {
    let (client, store, events) = setup();
    let repo: Repository<Account, String> = Repository::new(events);
    open(&repo, "a", 10).await;
    open(&repo, "b", 20).await;

    let mut subscription = store
        .observe::<AccountEvent>(Selector::category("account"), Some("balances"), None)
        .await
        .unwrap()
        .into_persistent()
        .unwrap();

    let mut balances = HashMap::new();
    let mut ids = Vec::new();
    for _ in 0..4 {
        let record = tokio::time::timeout(WAIT, subscription.recv())
            .await
            .unwrap()
            .unwrap();
        project(&mut balances, &record.stream_name, &record.data);
        subscription.ack(&record).await.unwrap();
        ids.push(record.id);
    }

    assert_eq!(balances.values().sum::<i64>(), 30);
    assert_eq!(client.acknowledged("$ce-account", "balances").await, ids);
    assert_eq!(client.in_flight("$ce-account", "balances").await, 0);

    subscription.close().await;
}

#[tokio::test]
async fn test_consumer_group_survives_reconnect() {
    let (client, store, events) = setup();
    let repo: Repository<Account, String> = Repository::new(events);
    open(&repo, "a", 10).await;

    let mut subscription = store
        .observe::<AccountEvent>(Selector::category("account"), Some("audit"), None)
        .await
        .unwrap()
        .into_persistent()
        .unwrap();

    let opened = tokio::time::timeout(WAIT, subscription.recv())
        .await
        .unwrap()
        .unwrap();
    subscription.ack(&opened).await.unwrap();

    // Left unacked across the reconnect
    let deposited = tokio::time::timeout(WAIT, subscription.recv())
        .await
        .unwrap()
        .unwrap();

    client.drop_connections().await;

    let redelivered = tokio::time::timeout(WAIT, subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(redelivered.id, deposited.id);
    assert!(redelivered.retry_count() > 0);

    let mut settled = false;
    for _ in 0..50 {
        if subscription.ack(&redelivered).await.is_ok() {
            settled = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(settled);

    subscription.close().await;
}
