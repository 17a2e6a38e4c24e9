//! Integration test suites.

mod anomalies;
mod lifecycle;
mod requests;
mod scenarios;
