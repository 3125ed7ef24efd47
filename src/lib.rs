pub mod calendar;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod pipeline;
pub mod scheduler;
pub mod scoring;
pub mod streak;
pub mod types;
