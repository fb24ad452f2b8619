//! Library crate for cred-scan-rs: a deduplicating, concurrency-bounded
//! scheduler for weak-credential probes against LAN hosts.
pub mod commands;
pub mod config;
pub mod dictionary;
pub mod error;
pub mod inventory;
pub mod notify;
pub mod parser;
pub mod policy;
pub mod probe;
pub mod runner;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod types;
