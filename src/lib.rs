pub mod auth;
pub mod circuit;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod time;
pub mod types;
