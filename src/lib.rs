#![doc = include_str!("../README.md")]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod http_client;
pub mod metrics;
pub mod notification;
pub mod proxy;
pub mod pushkin;
pub mod registry;
pub mod server;

pub use config::Config;
pub use dispatch::Dispatcher;
pub use error::{Error, Result};
pub use metrics::Metrics;
pub use notification::{Device, Notification};
pub use pushkin::Outcome;
pub use registry::Registry;
