//! Realtime delivery: an in-process broadcast hub that fans committed
//! messages out to the subscribers of each conversation, plus a reconnecting
//! WebSocket client for remote consumers.

pub mod protocol;
pub mod remote;

pub use protocol::{ClientFrame, Delivery, DeliveryHub, Publisher, ServerFrame, Subscription};
