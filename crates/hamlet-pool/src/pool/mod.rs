pub mod config;
pub mod dispatcher;
pub mod handler;
pub mod instance;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod worker;
