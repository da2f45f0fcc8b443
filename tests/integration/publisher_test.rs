use std::time::Duration;

use rabbitmq_hooks::rabbitmq::{ExchangePolicy, ListenerSpec, Payload, Publish};
use serde_json::json;

use crate::common::{drain, recording_handler, unique, Broker};

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn publishing_to_missing_exchange_fails_without_generation() {
    let broker = Broker::connect(ExchangePolicy::Verify).await;
    let exchange = unique("absent");
    broker.channels.get_channel().await.unwrap();

    let err = broker
        .publisher
        .publish(&exchange, Payload::from("hello"), "", None)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), format!("Exchange {} does not exist", exchange));

    // The primary channel is untouched by the failed check
    assert!(broker.channels.is_healthy().await);
    broker.close().await;
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn generation_creates_a_usable_exchange() {
    let broker = Broker::connect(ExchangePolicy::Generate).await;
    let exchange = unique("generated");

    broker
        .publisher
        .publish(&exchange, Payload::from("before anyone listens"), "", None)
        .await
        .unwrap();

    let (handler, mut rx) = recording_handler();
    let mut listener = broker.listener();
    listener
        .listen(
            &ListenerSpec {
                exchange: exchange.clone(),
                ..ListenerSpec::default()
            },
            handler,
        )
        .await
        .unwrap();

    broker
        .publisher
        .publish(&exchange, Payload::from(json!({"id": 1})), "any-key", None)
        .await
        .unwrap();

    assert_eq!(drain(&mut rx, Duration::from_secs(1)).await, vec![r#"{"id":1}"#]);

    listener.close().await.unwrap();
    broker.close().await;
}
