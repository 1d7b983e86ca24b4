pub mod kafka;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use kafka::{KafkaTransport, KafkaTransportConfig, ReplyEnvelope};
pub use transport::Transport;
