//! Core parley library (session lifecycle, message stream, compaction,
//! queue, config).

pub mod chat;
pub mod client;
pub mod compaction;
pub mod config;
pub mod config_store;
pub mod context;
pub mod error;
pub mod interrupt;
pub mod lifecycle;
pub mod logging;
pub mod queue;
pub mod recovery;
pub mod runtime;
pub mod stream;
pub mod tools;

#[cfg(test)]
mod test_support;
