pub mod config;
pub mod engine;
pub mod errors;
pub mod ingest;
pub mod locks;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod publisher;
pub mod rest;
pub mod store;
pub mod sweeper;
pub mod transport;
pub mod validate;
