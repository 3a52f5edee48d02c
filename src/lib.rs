pub mod app;
pub mod app_state;
pub mod cli;
pub mod configuration;
pub mod connection_state;
pub mod error;
pub mod event;
pub mod http;
pub mod installation;
pub mod process_log;
pub mod prober;
pub mod profile;
pub mod repository;
pub mod secret_store;
pub mod supervisor;
pub mod system;
pub mod traffic;
