//! `svcs-middleware` – observer fan-out.
//!
//! Carries engine output to whoever is watching (dashboards, the CLI, test
//! harnesses) without the engine knowing who they are.
//!
//! # Modules
//!
//! - [`bus`] – topic-based publish/subscribe event bus built on Tokio
//!   broadcast channels.

pub mod bus;

pub use bus::{EventBus, Topic, TopicReceiver};
