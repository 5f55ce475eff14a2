pub mod api;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod geo;
pub mod models;
pub mod observability;
pub mod orders;
pub mod retry;
pub mod state;
pub mod store;
