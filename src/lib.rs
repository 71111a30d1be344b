pub mod config;
pub mod dispatch;
pub mod fusion_core;
pub mod pipeline;
