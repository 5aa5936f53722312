pub mod auth;
pub mod config;
pub mod delivery;
pub mod errors;
pub mod patch;
pub mod repo;
pub mod safety;
pub mod sandbox;
pub mod server;
pub mod token;
