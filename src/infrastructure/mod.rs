pub mod config;
pub mod error;
pub mod remote_client;
pub mod storage;
