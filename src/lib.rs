pub mod broker;
pub mod config;
pub mod error;
pub mod manager;
pub mod pipeline;
pub mod protocol;
pub mod shutdown;
pub mod store;
pub mod transport;
pub mod worker;
