//! Credit ledger and generation rate limiter.

pub mod config;
pub mod dtos;
pub mod handlers;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
pub mod utils;

pub use startup::{AppState, Application, Collaborators};
