pub mod event;
pub mod publisher;
pub mod store;

pub use event::{NewOutboxEvent, OutboxEvent, OutboxStatus, MAX_OUTBOX_RETRIES};
pub use publisher::{BrokerEvent, TransactionalPublisher};
pub use store::{OutboxStore, OutboxWrite};
