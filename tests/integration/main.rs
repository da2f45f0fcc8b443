// Integration tests against a live RabbitMQ broker.
// Broker-backed tests are ignored by default: run them with
// `cargo test --test integration -- --ignored` and AMQP_URL pointing at a broker.

mod listener_test;
mod publisher_test;
