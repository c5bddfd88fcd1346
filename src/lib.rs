//! Tachikoma - Interruptible conversational agents on a publish/subscribe bus
//!
//! Each agent wraps a streaming text-generation backend. Inbound bus
//! messages become conversational turns; a new turn interrupts any
//! generation in flight, and every reply is tagged with the ids of the
//! messages it answered so consumers can reconstruct who replied to what.
//!
//! # Modules
//!
//! - [`agent`]: run loop, interrupt controller, lineage tracking
//! - [`topic`]: topic template codec and payload envelopes
//! - [`bus`]: publish/subscribe adapters (in-process and MQTT)
//! - [`providers`]: generation and embedding backends (Ollama)
//! - [`tools`]: tool trait, registry and built-in tools
//! - [`session`]: message model, conversation and history persistence
//! - [`archive`]: long-term message archive
//! - [`config`], [`error`], [`logging`]: ambient plumbing
//! - [`cli`]: command-line front end

pub mod agent;
pub mod archive;
pub mod bus;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod providers;
pub mod session;
pub mod tools;
pub mod topic;

pub use error::{Result, TachikomaError};
