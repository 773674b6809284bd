//! PostgreSQL change notification tests using testcontainers.
//!
//! Run with: cargo test --test postgres_notify --features container-tests -- --nocapture
//!
//! These tests spin up PostgreSQL in a container and drive the
//! `LISTEN/NOTIFY` source and the coordinator against it.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};
use tokio_util::sync::CancellationToken;

use token_exchange::config::{FanInConfig, ListenerConfig, RetryPolicy};
use token_exchange::exchange::MockExchangeClient;
use token_exchange::notify::{ListenerFactory, NotifyError, PgListenerFactory};
use token_exchange::{ChangeEvent, ExchangeCoordinator, ExchangeRequest};

const CHANNEL: &str = "user_replicated";

/// Start PostgreSQL container.
///
/// Returns (container, connection_string).
async fn start_postgres() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("postgres", "16")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stdout(
            "database system is ready to accept connections",
        ));

    let container = image
        .with_env_var("POSTGRES_USER", "exchange")
        .with_env_var("POSTGRES_PASSWORD", "exchange")
        .with_env_var("POSTGRES_DB", "exchange")
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start postgres container");

    // The ready message is printed once during init and once when serving.
    tokio::time::sleep(Duration::from_secs(1)).await;

    let host_port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get mapped port");
    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let connection_string = format!(
        "postgres://exchange:exchange@{}:{}/exchange",
        host, host_port
    );
    println!("PostgreSQL available at: {}", connection_string);

    (container, connection_string)
}

async fn connect(connection_string: &str, max_connections: u32) -> PgPool {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_millis(500))
        .connect(connection_string)
        .await
        .expect("Failed to connect to PostgreSQL")
}

async fn notify(pool: &PgPool, payload: &str) {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(CHANNEL)
        .bind(payload)
        .execute(pool)
        .await
        .expect("pg_notify failed");
}

fn listener_config() -> ListenerConfig {
    ListenerConfig {
        channel: CHANNEL.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_postgres_listener_receives_notifications() {
    let (_container, connection_string) = start_postgres().await;
    let pool = connect(&connection_string, 4).await;
    let factory = PgListenerFactory::new(pool.clone(), listener_config());

    let mut handle = factory.start(&CancellationToken::new()).await.unwrap();

    notify(&pool, r#"{"user_id":"u-1"}"#).await;
    notify(&pool, "not json").await;
    notify(&pool, r#"{"user_id":"u-2"}"#).await;

    let first = tokio::time::timeout(Duration::from_secs(5), handle.recv())
        .await
        .unwrap();
    assert_eq!(first, Some(ChangeEvent::subject("u-1")));

    let second = handle.recv().await.unwrap();
    assert!(second.decode_error.is_some());

    let third = handle.recv().await.unwrap();
    assert_eq!(third, ChangeEvent::subject("u-2"));

    handle.release().await;
    assert_eq!(handle.recv().await, None);
}

#[tokio::test]
async fn test_postgres_listener_holds_and_returns_connection() {
    let (_container, connection_string) = start_postgres().await;
    let pool = connect(&connection_string, 1).await;
    let factory = PgListenerFactory::new(pool.clone(), listener_config());

    let handle = factory.start(&CancellationToken::new()).await.unwrap();

    // The listener owns the only connection.
    assert!(pool.acquire().await.is_err());

    handle.release().await;
    assert!(pool.acquire().await.is_ok());
}

#[tokio::test]
async fn test_postgres_listener_acquire_failure() {
    let (_container, connection_string) = start_postgres().await;
    let pool = connect(&connection_string, 1).await;
    let factory = PgListenerFactory::new(pool.clone(), listener_config());

    let _held = pool.acquire().await.unwrap();
    let result = factory.start(&CancellationToken::new()).await;
    assert!(matches!(result, Err(NotifyError::Acquire(_))));
}

#[tokio::test]
async fn test_coordinator_wakes_on_postgres_notification() {
    let (_container, connection_string) = start_postgres().await;
    let pool = connect(&connection_string, 4).await;
    let factory: Arc<dyn ListenerFactory> =
        Arc::new(PgListenerFactory::new(pool.clone(), listener_config()));

    let client = Arc::new(MockExchangeClient::succeed_after(1, "internal"));
    let coordinator = ExchangeCoordinator::new(
        client.clone(),
        RetryPolicy::new(3, Duration::from_secs(30)),
        FanInConfig::default(),
    );

    let notifier = pool.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        notify(&notifier, r#"{"user_id":"someone-else"}"#).await;
        notify(&notifier, r#"{"user_id":"user-42"}"#).await;
    });

    let request = ExchangeRequest::new("applicant", "user-42", "external");
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        coordinator.exchange(&CancellationToken::new(), &request, &[factory]),
    )
    .await
    .expect("notification should wake the coordinator before the poll interval")
    .unwrap();

    assert_eq!(result.token, "internal");
    assert_eq!(client.call_count(), 2);
}
