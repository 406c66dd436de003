//! HTTP API: enqueue compilations, poll their status, fetch artifacts.

pub mod app;
