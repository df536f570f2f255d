pub mod app;
pub mod error;
pub mod logger;
pub mod models;
pub mod providers;
pub mod services;
pub mod utils;
pub mod workflow;
