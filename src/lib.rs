pub mod broker;
pub mod client;
pub mod domain;
pub mod instruments;
pub mod ledger;
pub mod monitoring;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod transport;
pub mod types;

pub use crate::types::*;
