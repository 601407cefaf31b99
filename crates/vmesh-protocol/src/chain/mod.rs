//! Multi-hop stream relay.
//!
//! Every hop is a real stream connection. A client dials the chain relay of
//! its next hop and sends a [`ChainSocketInitRequest`]; each relay dials the
//! next one the same way until the destination's neighbor connects to the
//! destination port directly. Status flows back hop by hop, and after a 200
//! the chain is a transparent byte pipe.
mod client;
mod server;
mod wire;

pub use client::{ChainConfig, ChainSocketFactory};
pub use server::ChainSocketServer;
pub use wire::{ChainSocketInitRequest, ChainSocketInitResponse, INIT_REQUEST_LEN, INIT_RESPONSE_LEN};
