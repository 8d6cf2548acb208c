//! This module provides reusable test utilities:
//! - A scripted container engine that records every call
//! - An in-memory snapshot engine
//! - Config builders (in-memory and on-disk)
//! - A mock webhook server

// Allow unused code in test fixtures - not every test binary uses every helper
#![allow(dead_code)]
#![allow(unused_imports)]

pub mod memory_snapshots;
pub mod mock_engine;
pub mod mock_webhook;
pub mod test_config;

// Re-export commonly used items
pub use memory_snapshots::MemorySnapshots;
pub use mock_engine::MockEngine;
pub use mock_webhook::MockWebhookServer;
pub use test_config::{test_context, TestConfigBuilder, TestDirs};
