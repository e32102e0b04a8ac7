pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod hub;
pub mod models;
pub mod observability;
pub mod projection;
pub mod state;
pub mod store;
