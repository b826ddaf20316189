//! Checkout flow
//!
//! `order` holds the session state machine and fulfilment data, `messages`
//! the message templates, and `orchestrator` runs a session end to end.

pub mod messages;
pub mod orchestrator;
pub mod order;

pub use orchestrator::{CheckoutOrchestrator, CheckoutOutcome, CheckoutReport, FailureReason, TopUpReport};
pub use order::{
    CheckoutError, CheckoutSession, CheckoutStage, ContactInfo, DeliveryChoice, Fulfillment, Order,
    Product, ShippingInfo, ShippingType,
};
