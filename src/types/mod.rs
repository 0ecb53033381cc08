//! Core types shared by the daemon and the event pipeline.

mod config;
mod event;
mod message;

pub use config::{AppIdentity, BrokerConfig, ConfigError, ConsumerGroup, SigningConfig};
pub use event::{Event, Payload};
pub use message::{DeliveryReceipt, InboundMessage};
