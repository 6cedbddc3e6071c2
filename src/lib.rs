//! ValorMM: a Qwen2-VL chat API with streaming output, plus its benchmark client.

pub mod bench;
pub mod chat;
pub mod comms;
pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod vlm;
