//! frameflow - frame-metadata orchestration over consumer-group streams
//!
//! Two things live here:
//!
//! - the **orchestrator**: consumes frame events from the ingest stream,
//!   routes each one to every registered processor whose capabilities
//!   match, and acknowledges the ingest entry only after all target
//!   queues accepted the write (at-least-once, per-queue FIFO);
//! - the **processor client** ([`client::ProcessorClient`]): the library a
//!   processor embeds to register, heartbeat, pull work from its own
//!   queue and emit results with the frame's trace context intact.
//!
//! Delivery is at-least-once end to end; processors must be idempotent.
//! Ordering across cameras is not a contract, and per-camera FIFO is soft
//! (see [`router`]).

pub mod backpressure;
pub mod client;
pub mod config;
pub mod consumer;
pub mod control;
pub mod demo;
pub mod error;
pub mod frame;
pub mod orchestrator;
pub mod queues;
pub mod registry;
pub mod router;
pub mod streams;
pub mod telemetry;
pub mod tracectx;

pub use client::{ClientConfig, ProcessorClient};
pub use error::{FlowError, FlowResult};
pub use frame::FrameEvent;
pub use tracectx::TraceContext;
