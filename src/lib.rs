pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod messages;
pub mod router;
pub mod routes;
pub mod store;
pub mod throttle;
