//! Client side of agent-relay: NDJSON reassembly, the observable conversation, render
//! grouping and a small async HTTP client.

pub mod client;
pub mod conversation;
pub mod present;
pub mod reassembler;

pub use client::{ClientError, RelayClient, RunOutcome, DEFAULT_BASE_URL};
pub use conversation::{Conversation, ConversationUpdate};
pub use present::{group_messages, render_plain, RenderGroup};
pub use reassembler::NdjsonReassembler;
