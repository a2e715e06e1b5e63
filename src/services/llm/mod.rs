pub mod client;

pub use client::{LlmClient, LlmService, extract_json};
