pub mod app;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod helper;
pub mod server;
pub mod service;
pub mod storage;
