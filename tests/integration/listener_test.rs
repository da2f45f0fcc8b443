use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use amq_protocol_types::FieldTable;
use lapin::{options::ExchangeDeclareOptions, ExchangeKind};
use rabbitmq_hooks::rabbitmq::{
    ExchangePolicy, ListenerSpec, Message, MessageHandler, Payload, Publish, RabbitMQError,
};
use tokio::sync::mpsc;

use crate::common::{create_exchange, drain, recording_handler, unique, Broker};

fn fanout(exchange: &str) -> ListenerSpec {
    ListenerSpec {
        exchange: exchange.to_string(),
        ..ListenerSpec::default()
    }
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn listening_on_missing_exchange_fails() {
    let broker = Broker::connect(ExchangePolicy::Verify).await;
    let exchange = unique("missing");
    let (handler, mut rx) = recording_handler();

    let mut listener = broker.listener();
    let err = listener.listen(&fanout(&exchange), handler).await.unwrap_err();
    assert!(matches!(err, RabbitMQError::ExchangeNotFound(_)));
    assert_eq!(err.to_string(), format!("Exchange {} does not exist", exchange));
    assert!(listener.binding().is_none());

    assert!(drain(&mut rx, Duration::from_millis(300)).await.is_empty());
    broker.close().await;
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn verification_channel_recovers_after_not_found() {
    let broker = Broker::connect(ExchangePolicy::Verify).await;
    let existing = unique("existing");
    create_exchange(&existing).await;

    for _ in 0..2 {
        let err = broker
            .resolver
            .resolve_exchange(&unique("missing"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        broker.resolver.resolve_exchange(&existing).await.unwrap();
    }
    broker.close().await;
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn receives_messages_in_order() {
    let broker = Broker::connect(ExchangePolicy::Verify).await;
    let exchange = unique("ordered");
    create_exchange(&exchange).await;

    let (handler, mut rx) = recording_handler();
    let mut listener = broker.listener();
    let binding = listener.listen(&fanout(&exchange), handler).await.unwrap();
    assert!(binding.queue.starts_with("amq.gen-"));
    assert!(!binding.consumer_tag.is_empty());

    for text in ["test message 1", "test message 2"] {
        broker
            .publisher
            .publish(&exchange, Payload::from(text), "", None)
            .await
            .unwrap();
    }

    let received = drain(&mut rx, Duration::from_secs(1)).await;
    assert_eq!(received, vec!["test message 1", "test message 2"]);

    listener.close().await.unwrap();
    broker.close().await;
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn independent_queues_each_get_a_copy() {
    let broker = Broker::connect(ExchangePolicy::Verify).await;
    let exchange = unique("broadcast");
    create_exchange(&exchange).await;

    let (first_handler, mut first_rx) = recording_handler();
    let (second_handler, mut second_rx) = recording_handler();
    let mut first = broker.listener();
    let mut second = broker.listener();
    first.listen(&fanout(&exchange), first_handler).await.unwrap();
    second.listen(&fanout(&exchange), second_handler).await.unwrap();

    broker
        .publisher
        .publish(&exchange, Payload::from("hello"), "", None)
        .await
        .unwrap();

    assert_eq!(drain(&mut first_rx, Duration::from_secs(1)).await, vec!["hello"]);
    assert_eq!(drain(&mut second_rx, Duration::from_millis(200)).await, vec!["hello"]);

    first.close().await.unwrap();
    second.close().await.unwrap();
    broker.close().await;
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn shared_named_queue_delivers_to_one_consumer() {
    let broker = Broker::connect(ExchangePolicy::Verify).await;
    let exchange = unique("competing");
    create_exchange(&exchange).await;

    let spec = ListenerSpec {
        exchange: exchange.clone(),
        queue: unique("shared-queue"),
        ..ListenerSpec::default()
    };
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut listeners = Vec::new();
    for id in ["first", "second"] {
        let tx = tx.clone();
        let handler = move |_message: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(id.to_string());
                Ok::<(), anyhow::Error>(())
            }
        };
        let mut listener = broker.listener();
        let binding = listener.listen(&spec, Arc::new(handler)).await.unwrap();
        assert_eq!(binding.queue, spec.queue);
        listeners.push(listener);
    }

    broker
        .publisher
        .publish(&exchange, Payload::from("only once"), "", None)
        .await
        .unwrap();

    let handled = drain(&mut rx, Duration::from_secs(1)).await;
    assert_eq!(handled.len(), 1, "handled by {:?}", handled);

    for listener in &mut listeners {
        listener.close().await.unwrap();
    }
    broker.close().await;
}

struct FlakyHandler {
    attempts: AtomicUsize,
    failures: usize,
    handled: mpsc::UnboundedSender<String>,
}

#[async_trait::async_trait]
impl MessageHandler for FlakyHandler {
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        anyhow::ensure!(attempt > self.failures, "attempt {} fails on purpose", attempt);
        let _ = self.handled.send(message.text());
        Ok(())
    }
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn failed_handling_is_redelivered_until_it_succeeds() {
    let broker = Broker::connect(ExchangePolicy::Verify).await;
    let exchange = unique("redelivery");
    create_exchange(&exchange).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = Arc::new(FlakyHandler {
        attempts: AtomicUsize::new(0),
        failures: 2,
        handled: tx,
    });
    let mut listener = broker.listener();
    listener.listen(&fanout(&exchange), handler.clone()).await.unwrap();

    broker
        .publisher
        .publish(&exchange, Payload::from("retry me"), "", None)
        .await
        .unwrap();

    let handled = drain(&mut rx, Duration::from_secs(2)).await;
    assert_eq!(handled, vec!["retry me"]);
    assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);

    listener.close().await.unwrap();
    broker.close().await;
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn consumer_stops_when_its_channel_closes() {
    let broker = Broker::connect(ExchangePolicy::Generate).await;
    let exchange = unique("channel-close");
    let (handler, _rx) = recording_handler();

    let mut listener = broker.listener();
    listener.listen(&fanout(&exchange), handler).await.unwrap();
    assert!(listener.is_consuming());

    // Redeclaring with different flags makes the broker close the channel
    let channel = broker.channels.get_channel().await.unwrap();
    let err = channel
        .exchange_declare(
            &exchange,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await;
    assert!(err.is_err());

    for _ in 0..50 {
        if !listener.is_consuming() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!listener.is_consuming());
    assert!(listener.binding().is_some());

    listener.close().await.unwrap();
    broker.close().await;
}
