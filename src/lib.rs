pub mod apis;
pub mod channel;
pub mod config;
pub mod constants;
pub mod db;
pub mod error;
pub mod infra;
pub mod observability;
pub mod pipeline;
pub mod storage;
pub mod types;
