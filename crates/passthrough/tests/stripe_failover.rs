use std::time::Duration;

use passthrough::error::PassthroughError;
use passthrough::server_process::ProcessRole;
use passthrough::services::ServiceCatalog;
use passthrough::testing::{
    CounterCodec, CounterMessage, CounterResponse, CounterService, COUNTER_CLASS, COUNTER_VERSION,
};
use passthrough::types::EntityTuple;
use passthrough::{ClusterControl, StripeConfig};

async fn stripe(names: &[&str], service: &CounterService) -> ClusterControl {
    let config = StripeConfig {
        election_seed: Some(11),
        ..StripeConfig::with_servers(names.iter().copied())
    };
    ClusterControl::start(config, ServiceCatalog::new().with_entity_service(service.clone()))
        .await
        .unwrap()
}

async fn wait_for_running(stripe: &ClusterControl, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while stripe.running_server_names().await.len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("servers did not reach the expected count");
}

#[tokio::test]
async fn fetched_counter_survives_active_failover() {
    let service = CounterService::new();
    let stripe = stripe(&["a", "b", "c"], &service).await;
    let first = stripe.active_server_name().await.unwrap();

    let connection = stripe.connect_client("client").await.unwrap();
    let counter = connection.entity_ref(COUNTER_CLASS, "c", COUNTER_VERSION);
    counter.create(b"config".to_vec()).await.unwrap();
    let endpoint = counter.fetch().await.unwrap();
    assert_eq!(endpoint.configuration(), b"config".to_vec());
    for _ in 0..3 {
        endpoint
            .invoke_with_codec(&CounterCodec, &CounterMessage::Increment(2), true)
            .await
            .unwrap();
    }

    stripe.terminate_active().await.unwrap();
    let second = stripe.active_server_name().await.unwrap();
    assert_ne!(first, second);
    assert_eq!(service.stats().reconnects(), 1);
    assert_eq!(stripe.metrics().failovers.get(), 1);

    let value = endpoint
        .invoke_with_codec(&CounterCodec, &CounterMessage::Get, true)
        .await
        .unwrap();
    assert_eq!(value, CounterResponse::Value(6));

    let snapshot = stripe.snapshot(&second).await.unwrap();
    assert_eq!(snapshot.role, ProcessRole::Active);
    assert_eq!(snapshot.entities, vec![EntityTuple::new(COUNTER_CLASS, "c")]);
    assert_eq!(snapshot.passives, 1);
    assert!(matches!(
        stripe.snapshot(&first).await,
        Err(PassthroughError::ServerNotRunning { .. })
    ));

    stripe.shutdown().await;
}

#[tokio::test]
async fn restarted_passive_synchronizes_and_can_take_over() {
    let service = CounterService::new();
    let stripe = stripe(&["a", "b", "c"], &service).await;
    let connection = stripe.connect_client("client").await.unwrap();
    let counter = connection.entity_ref(COUNTER_CLASS, "c", COUNTER_VERSION);
    counter.create(Vec::new()).await.unwrap();
    let endpoint = counter.fetch().await.unwrap();
    endpoint
        .invoke_with_codec(&CounterCodec, &CounterMessage::Increment(7), true)
        .await
        .unwrap();

    let first = stripe.active_server_name().await.unwrap();
    stripe.terminate_active().await.unwrap();
    assert!(stripe.start_one_server().await.unwrap());
    assert!(!stripe.start_one_server().await.unwrap());

    let restarted = stripe.snapshot(&first).await.unwrap();
    assert_eq!(restarted.role, ProcessRole::Passive);
    assert_eq!(restarted.entities, vec![EntityTuple::new(COUNTER_CLASS, "c")]);

    // Whichever server ends up last, it holds the value either through
    // replication or through synchronization.
    stripe.terminate_active().await.unwrap();
    stripe.terminate_active().await.unwrap();
    wait_for_running(&stripe, 1).await;
    let value = endpoint
        .invoke_with_codec(&CounterCodec, &CounterMessage::Get, true)
        .await
        .unwrap();
    assert_eq!(value, CounterResponse::Value(7));
    assert_eq!(service.stats().reconnects(), 3);

    stripe.shutdown().await;
}

#[tokio::test]
async fn parked_client_resumes_when_a_server_returns() {
    let service = CounterService::new();
    let stripe = stripe(&["solo"], &service).await;
    let connection = stripe.connect_client("client").await.unwrap();
    let counter = connection.entity_ref(COUNTER_CLASS, "c", COUNTER_VERSION);
    counter.create(Vec::new()).await.unwrap();
    let endpoint = counter.fetch().await.unwrap();
    endpoint
        .invoke_with_codec(&CounterCodec, &CounterMessage::Increment(5), true)
        .await
        .unwrap();

    stripe.terminate_active().await.unwrap();
    assert_eq!(stripe.active_server_name().await, None);
    assert!(matches!(
        stripe.connect_client("late").await,
        Err(PassthroughError::NoActiveServer)
    ));

    let parked = tokio::spawn(async move {
        endpoint
            .invoke_with_codec(&CounterCodec, &CounterMessage::Increment(1), true)
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!parked.is_finished());

    assert!(stripe.start_one_server().await.unwrap());
    let value = tokio::time::timeout(Duration::from_secs(5), parked)
        .await
        .expect("parked invocation never completed")
        .unwrap()
        .unwrap();
    assert_eq!(value, CounterResponse::Value(6));

    stripe.shutdown().await;
}

#[tokio::test]
async fn terminating_passives_leaves_the_active_alone() {
    let service = CounterService::new();
    let stripe = stripe(&["a", "b"], &service).await;
    let active = stripe.active_server_name().await.unwrap();

    assert!(stripe.terminate_one_passive().await.unwrap());
    assert!(!stripe.terminate_one_passive().await.unwrap());
    assert_eq!(stripe.running_server_names().await, vec![active.clone()]);
    assert_eq!(stripe.snapshot(&active).await.unwrap().passives, 0);

    stripe.start_all_servers().await.unwrap();
    wait_for_running(&stripe, 2).await;
    assert_eq!(stripe.snapshot(&active).await.unwrap().passives, 1);
    assert_eq!(stripe.metrics().servers_running.get(), 2);

    stripe.shutdown().await;
    assert_eq!(stripe.metrics().servers_running.get(), 0);
}

/// The active is stopped while its passive still applies an increment. The
/// interrupted invocation is answered by the new active, so the answer the
/// client saw is the value the stripe kept.
#[tokio::test]
async fn invocation_in_flight_at_termination_is_answered_by_the_new_active() {
    let service = CounterService::new().with_passive_delay(Duration::from_millis(300));
    let stripe = stripe(&["a", "b"], &service).await;
    let connection = stripe.connect_client("client").await.unwrap();
    let counter = connection.entity_ref(COUNTER_CLASS, "c", COUNTER_VERSION);
    counter.create(Vec::new()).await.unwrap();
    let endpoint = counter.fetch().await.unwrap();
    let first = stripe.active_server_name().await.unwrap();

    let in_flight = tokio::spawn(async move {
        let answer = endpoint
            .invoke_with_codec(&CounterCodec, &CounterMessage::Increment(1), true)
            .await;
        (endpoint, answer)
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!in_flight.is_finished());
    stripe.terminate_active().await.unwrap();
    assert_ne!(stripe.active_server_name().await.unwrap(), first);

    let (endpoint, answer) = tokio::time::timeout(Duration::from_secs(5), in_flight)
        .await
        .expect("in-flight invocation never completed")
        .unwrap();
    let CounterResponse::Value(answered) = answer.unwrap();
    assert!(answered >= 1);
    let kept = endpoint
        .invoke_with_codec(&CounterCodec, &CounterMessage::Get, true)
        .await
        .unwrap();
    assert_eq!(kept, CounterResponse::Value(answered));

    stripe.shutdown().await;
}
