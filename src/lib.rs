//! easel - MCP bridge between LLM hosts and a local Stable Diffusion engine
//!
//! This library provides the generation pipeline, LoRA catalog, content
//! classifier, conversation store, LLM router, and the MCP tool surface.
//! The server binary is in `main.rs`, admin CLI in `bin/easel-admin.rs`.

pub mod chat;
pub mod config;
pub mod content;
pub mod convo;
pub mod error;
pub mod llm;
pub mod lora;
pub mod mcp_server;
pub mod paths;
pub mod queue;
pub mod sd;
pub mod state;
pub mod upload;

use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sorted)
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// Get current Unix timestamp in milliseconds
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_is_valid_uuid() {
        let id = new_id();
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn test_new_id_is_sortable() {
        let id1 = new_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = new_id();
        // UUIDv7 is time-sorted, so id2 should be greater
        assert!(id2 > id1);
    }
}
