pub mod forwarder;
pub mod router;
pub mod strategy;

pub use forwarder::LiteForwarder;
pub use strategy::{ConnectionGuard, Strategy, StrategyManager};
