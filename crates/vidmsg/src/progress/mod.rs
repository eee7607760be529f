//! Progress event fan-out.

pub mod hub;

pub use hub::{ProgressHub, PublishOutcome, SubscribeError, Subscription};
