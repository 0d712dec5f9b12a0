//! Repository lifecycle through the public API.

use tessera::config::RepositoryConfig;
use tessera::{AggregateRoot, DeleteMode, Repository, RepositoryError};

use crate::common::{deposit, setup, Account, AccountEvent};

#[tokio::test]
async fn test_account_lifecycle() {
    let (client, _, events) = setup();
    let repo: Repository<Account, String> = Repository::new(events);

    let mut account = AggregateRoot::new("alice".to_string());
    account.raise(AccountEvent::Opened {
        owner: "Alice".to_string(),
    });
    account.raise(deposit(500));
    repo.add(&mut account).await.unwrap();
    assert_eq!(account.version(), 2);

    let mut loaded = repo.get(&"alice".to_string()).await.unwrap();
    assert_eq!(loaded.state().balance, 500);

    loaded.execute(|a| a.withdraw(200)).unwrap();
    repo.update(&mut loaded).await.unwrap();
    assert_eq!(loaded.version(), 3);

    let rejected = loaded.execute(|a| a.withdraw(10_000));
    assert!(rejected.is_err());
    assert!(!loaded.has_pending_events());

    let reloaded = repo.get(&"alice".to_string()).await.unwrap();
    assert_eq!(reloaded.state().balance, 300);
    assert_eq!(reloaded.state().owner.as_deref(), Some("Alice"));
    assert_eq!(client.append_calls(), 2);
}

#[tokio::test]
async fn test_lost_update_is_rejected() {
    let (_, _, events) = setup();
    let repo: Repository<Account, String> = Repository::new(events);

    let mut account = AggregateRoot::new("bob".to_string());
    account.raise(AccountEvent::Opened {
        owner: "Bob".to_string(),
    });
    account.raise(deposit(100));
    repo.add(&mut account).await.unwrap();

    let mut first = repo.get(&"bob".to_string()).await.unwrap();
    let mut second = repo.get(&"bob".to_string()).await.unwrap();

    first.execute(|a| a.withdraw(100)).unwrap();
    second.execute(|a| a.withdraw(100)).unwrap();

    repo.update(&mut first).await.unwrap();
    match repo.update(&mut second).await {
        Err(RepositoryError::Concurrency(conflict)) => {
            assert_eq!(conflict.stream, "account-bob");
            assert_eq!(conflict.expected, 2);
            assert_eq!(conflict.actual, 3);
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    // Reload and decide again
    let mut retry = repo.get(&"bob".to_string()).await.unwrap();
    assert!(retry.execute(|a| a.withdraw(100)).is_err());
    assert_eq!(retry.state().balance, 0);
}

#[tokio::test]
async fn test_soft_delete_from_config() {
    let (client, _, events) = setup();
    let config = RepositoryConfig {
        delete_mode: DeleteMode::Soft,
        ..RepositoryConfig::default()
    };
    let repo: Repository<Account, String> =
        Repository::for_config(events, &config).with_soft_delete();

    let mut account = AggregateRoot::new("carol".to_string());
    account.raise(AccountEvent::Opened {
        owner: "Carol".to_string(),
    });
    repo.add(&mut account).await.unwrap();

    repo.remove(&"carol".to_string()).await.unwrap();

    let closed = repo.get(&"carol".to_string()).await.unwrap();
    assert!(closed.state().closed);
    assert_eq!(closed.version(), 2);
    assert_eq!(client.delete_calls(), 0);
}

#[tokio::test]
async fn test_hard_delete() {
    let (client, _, events) = setup();
    let repo: Repository<Account, String> =
        Repository::new(events).with_delete_mode(DeleteMode::Hard);

    let mut account = AggregateRoot::new("dave".to_string());
    account.raise(AccountEvent::Opened {
        owner: "Dave".to_string(),
    });
    repo.add(&mut account).await.unwrap();
    assert!(repo.exists(&"dave".to_string()).await.unwrap());

    let reads = client.read_calls();
    repo.remove(&"dave".to_string()).await.unwrap();
    assert_eq!(client.read_calls(), reads);

    assert!(!repo.exists(&"dave".to_string()).await.unwrap());
    assert!(matches!(
        repo.get(&"dave".to_string()).await,
        Err(RepositoryError::NotFound { .. })
    ));
}
