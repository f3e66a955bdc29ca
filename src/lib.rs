// ===============================
// src/lib.rs
// ===============================
pub mod domain;
pub mod config;
pub mod metrics;
pub mod recorder;

// session & REST
pub mod session;
pub mod gateway;
pub mod api;
pub mod auth;

// push streams
pub mod stream;
pub mod feed;
pub mod account;
pub mod positions;

// trading
pub mod instruments;
pub mod risk;
pub mod orders;
pub mod capital;
