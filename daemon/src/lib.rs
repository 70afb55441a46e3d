//! procwatch: process sampling, rolling history and anomaly detection.

pub mod collector;
pub mod config;
pub mod controller;
pub mod db;
pub mod detector;
pub mod error;
pub mod history;
pub mod monitor;
pub mod notifier;
pub mod protocol;
pub mod registry;
pub mod sample;
pub mod socket;
pub mod source;
