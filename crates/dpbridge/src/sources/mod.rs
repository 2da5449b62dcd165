//! Source account plugins. Each registers a factory in
//! [`SOURCE_REGISTRY`](crate::source::SOURCE_REGISTRY).

#[cfg(feature = "source_mqtt")]
pub mod mqtt;
