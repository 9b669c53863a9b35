pub mod auth;
pub mod bot;
pub mod config;
pub mod constants;
pub mod extractors;
pub mod logging;
pub mod middleware;
pub mod pipeline;
pub mod response;
pub mod routes;
pub mod schedule;
pub mod services;
pub mod state;
pub mod store;
pub mod workers;
