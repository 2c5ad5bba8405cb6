pub mod antifraud;
pub mod app;
pub mod canonical;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod idempotency;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod payments;
pub mod pix;
pub mod postgres;
pub mod rate_limiter;
pub mod reaper;
