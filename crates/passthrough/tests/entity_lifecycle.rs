use std::time::Duration;

use passthrough::connection::EndpointDelegate;
use passthrough::error::EntityError;
use passthrough::services::ServiceCatalog;
use passthrough::testing::{
    CounterCodec, CounterMessage, CounterResponse, CounterService, COUNTER_CLASS, COUNTER_VERSION,
    REJECTED_CONFIGURATION,
};
use passthrough::types::EntityTuple;
use passthrough::{ClusterControl, StripeConfig};
use tokio::sync::mpsc;

async fn solo() -> ClusterControl {
    ClusterControl::start(
        StripeConfig::with_servers(["solo"]),
        ServiceCatalog::new().with_entity_service(CounterService::new()),
    )
    .await
    .unwrap()
}

fn tuple(name: &str) -> EntityTuple {
    EntityTuple::new(COUNTER_CLASS, name)
}

#[tokio::test]
async fn create_exists_and_duplicate_create() {
    let stripe = solo().await;
    let connection = stripe.connect_client("client").await.unwrap();
    let counter = connection.entity_ref(COUNTER_CLASS, "c", COUNTER_VERSION);

    assert!(!counter.exists().await.unwrap());
    counter.create(Vec::new()).await.unwrap();
    assert!(counter.exists().await.unwrap());

    let err = counter.create(Vec::new()).await.unwrap_err();
    assert_eq!(err.as_entity_error(), Some(&EntityError::already_exists(&tuple("c"))));
    assert_eq!(stripe.metrics().entities.get(), 1);

    stripe.shutdown().await;
}

#[tokio::test]
async fn unknown_class_and_wrong_version_are_refused() {
    let stripe = solo().await;
    let connection = stripe.connect_client("client").await.unwrap();

    let unknown = connection.entity_ref("map", "m", 1);
    let err = unknown.create(Vec::new()).await.unwrap_err();
    assert_eq!(
        err.as_entity_error(),
        Some(&EntityError::not_provided(&EntityTuple::new("map", "m")))
    );

    connection
        .entity_ref(COUNTER_CLASS, "c", COUNTER_VERSION)
        .create(Vec::new())
        .await
        .unwrap();
    let err = connection
        .entity_ref(COUNTER_CLASS, "c", 2)
        .fetch()
        .await
        .unwrap_err();
    assert_eq!(
        err.as_entity_error(),
        Some(&EntityError::version_mismatch(&tuple("c"), 1, 2))
    );

    let err = connection
        .entity_ref(COUNTER_CLASS, "missing", COUNTER_VERSION)
        .fetch()
        .await
        .unwrap_err();
    assert_eq!(err.as_entity_error(), Some(&EntityError::not_found(&tuple("missing"))));

    stripe.shutdown().await;
}

#[tokio::test]
async fn reconfigure_returns_previous_configuration() {
    let stripe = solo().await;
    let connection = stripe.connect_client("client").await.unwrap();
    let counter = connection.entity_ref(COUNTER_CLASS, "c", COUNTER_VERSION);
    counter.create(b"one".to_vec()).await.unwrap();

    let previous = counter.reconfigure(b"two".to_vec()).await.unwrap();
    assert_eq!(previous, b"one".to_vec());

    let err = counter
        .reconfigure(REJECTED_CONFIGURATION.to_vec())
        .await
        .unwrap_err();
    assert!(matches!(
        err.as_entity_error(),
        Some(EntityError::Configuration { .. })
    ));

    let endpoint = counter.fetch().await.unwrap();
    assert_eq!(endpoint.configuration(), b"two".to_vec());

    stripe.shutdown().await;
}

#[tokio::test]
async fn destroy_waits_for_fetches_to_release() {
    let stripe = solo().await;
    let connection = stripe.connect_client("client").await.unwrap();
    let counter = connection.entity_ref(COUNTER_CLASS, "c", COUNTER_VERSION);
    counter.create(Vec::new()).await.unwrap();
    let endpoint = counter.fetch().await.unwrap();

    assert!(!counter.destroy().await.unwrap());
    endpoint.release().await.unwrap();
    assert!(counter.destroy().await.unwrap());
    assert!(!counter.exists().await.unwrap());
    assert_eq!(stripe.metrics().entities.get(), 0);

    // A released endpoint cannot be used again.
    assert!(endpoint.invoke_and_retire(Vec::new(), true).await.is_err());

    let err = counter.destroy().await.unwrap_err();
    assert_eq!(err.as_entity_error(), Some(&EntityError::not_found(&tuple("c"))));

    stripe.shutdown().await;
}

#[tokio::test]
async fn entity_failures_reach_the_caller() {
    let stripe = solo().await;
    let connection = stripe.connect_client("client").await.unwrap();
    let counter = connection.entity_ref(COUNTER_CLASS, "c", COUNTER_VERSION);
    counter.create(Vec::new()).await.unwrap();
    let endpoint = counter.fetch().await.unwrap();

    let err = endpoint
        .invoke_with_codec(&CounterCodec, &CounterMessage::Fail, true)
        .await
        .unwrap_err();
    assert!(matches!(err.as_entity_error(), Some(EntityError::Server { .. })));
    assert!(err.to_string().contains("requested failure"), "got: {err}");

    // The entity keeps working after a failed invocation.
    let value = endpoint
        .invoke_with_codec(&CounterCodec, &CounterMessage::Increment(4), true)
        .await
        .unwrap();
    assert_eq!(value, CounterResponse::Value(4));

    stripe.shutdown().await;
}

#[tokio::test]
async fn self_messages_run_before_the_sender_retires() {
    let stripe = solo().await;
    let connection = stripe.connect_client("client").await.unwrap();
    let counter = connection.entity_ref(COUNTER_CLASS, "c", COUNTER_VERSION);
    counter.create(Vec::new()).await.unwrap();
    let endpoint = counter.fetch().await.unwrap();

    let value = endpoint
        .invoke_with_codec(&CounterCodec, &CounterMessage::IncrementLater(3), true)
        .await
        .unwrap();
    assert_eq!(value, CounterResponse::Value(0));

    let value = endpoint
        .invoke_with_codec(&CounterCodec, &CounterMessage::Get, true)
        .await
        .unwrap();
    assert_eq!(value, CounterResponse::Value(3));

    stripe.shutdown().await;
}

struct Forward(mpsc::UnboundedSender<Vec<u8>>);

impl EndpointDelegate for Forward {
    fn handle_message(&mut self, payload: &[u8]) {
        let _ = self.0.send(payload.to_vec());
    }
}

#[tokio::test]
async fn server_pushes_reach_the_endpoint_delegate() {
    let stripe = solo().await;
    let connection = stripe.connect_client("client").await.unwrap();
    let counter = connection.entity_ref(COUNTER_CLASS, "c", COUNTER_VERSION);
    counter.create(Vec::new()).await.unwrap();
    let endpoint = counter.fetch().await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    endpoint.set_delegate(Box::new(Forward(tx)));

    endpoint
        .invoke_with_codec(&CounterCodec, &CounterMessage::Broadcast(b"hello".to_vec()), false)
        .await
        .unwrap();
    let pushed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no push received");
    assert_eq!(pushed, Some(b"hello".to_vec()));

    stripe.shutdown().await;
}

#[tokio::test]
async fn closing_a_connection_releases_its_fetches() {
    let stripe = solo().await;
    let owner = stripe.connect_client("owner").await.unwrap();
    let counter = owner.entity_ref(COUNTER_CLASS, "c", COUNTER_VERSION);
    counter.create(Vec::new()).await.unwrap();
    let _endpoint = counter.fetch().await.unwrap();
    assert_eq!(stripe.metrics().connections.get(), 1);

    owner.close().await;
    assert!(owner.is_closed());
    assert!(counter.exists().await.is_err());

    let other = stripe.connect_client("other").await.unwrap();
    let counter = other.entity_ref(COUNTER_CLASS, "c", COUNTER_VERSION);
    assert!(counter.destroy().await.unwrap());

    tokio::time::timeout(Duration::from_secs(5), async {
        while stripe.metrics().connections.get() != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("closed connection was not dropped");

    stripe.shutdown().await;
}

#[tokio::test]
async fn invocations_run_under_the_assigned_concurrency_key() {
    let stripe = solo().await;
    let connection = stripe.connect_client("client").await.unwrap();
    let counter = connection.entity_ref(COUNTER_CLASS, "c", COUNTER_VERSION);
    counter.create(Vec::new()).await.unwrap();
    let endpoint = counter.fetch().await.unwrap();

    let key = endpoint
        .invoke_with_codec(&CounterCodec, &CounterMessage::ConcurrencyKey, false)
        .await
        .unwrap();
    assert_eq!(key, CounterResponse::Value(1));

    stripe.shutdown().await;
}
