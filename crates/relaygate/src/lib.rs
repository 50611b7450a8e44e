//! Streaming chat gateway.
//!
//! Puts many chat-completion backends behind one request shape and one SSE
//! event stream, governed by per-provider rate limits and circuit breakers.

pub mod advise;
pub mod config;
pub mod error;
pub mod handlers;
pub mod llm;
pub mod production;
pub mod server;
pub mod sse_parser;
pub mod transport;
