//! Agent module - Turn-taking, interruption and causal lineage
//!
//! This module provides the run loop that turns bus traffic into replies.
//! The agent is responsible for:
//!
//! - Appending every inbound turn from other speakers to its conversation
//! - Interrupting an in-flight generation when a new turn arrives
//! - Streaming the backend's reply and dispatching requested tools
//! - Publishing exactly one reply per settled turn, stamped with the ids of
//!   every message it was generated from
//! - Committing a reply to its conversation only once the bus acknowledges it
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │     Bus     │────>│   RunLoop   │────>│ ChatBackend │
//! │  (inbound)  │<────│             │<────│  (stream)   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                       │    │    │
//!                       ▼    ▼    ▼
//!            ┌───────────┐ ┌─────────┐ ┌──────────────┐
//!            │ Interrupt │ │ Lineage │ │ ToolRegistry │
//!            │Controller │ │         │ │              │
//!            └───────────┘ └─────────┘ └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tachikoma::agent::RunLoop;
//! use tachikoma::bus::MemoryBroker;
//! use tachikoma::config::Config;
//! use tachikoma::providers::OllamaBackend;
//!
//! async fn run_agent() -> tachikoma::Result<()> {
//!     let config = Config::default();
//!     let broker = MemoryBroker::new();
//!     let (bus, inbound) = broker.connect("tachikoma");
//!     let backend = OllamaBackend::new(&config.backend.base_url, &config.backend.model);
//!
//!     let run_loop = RunLoop::new(&config, Arc::new(bus), Arc::new(backend))?;
//!     let conversation = run_loop.run(inbound).await?;
//!     println!("{} messages", conversation.len());
//!     Ok(())
//! }
//! ```

mod context;
pub mod interrupt;
pub mod lineage;
mod r#loop;

pub use context::ContextBuilder;
pub use interrupt::{GenerationHandle, InterruptController};
pub use r#loop::{RunLoop, TurnEvent};
