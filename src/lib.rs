pub mod annotate;
pub mod commands;
pub mod config;
pub mod deployment;
pub mod error;
pub mod events;
pub mod ledger;
pub mod markets;
pub mod render;
pub mod rpc;
pub mod scanner;
pub mod tracer;
