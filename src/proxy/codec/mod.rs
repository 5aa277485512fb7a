pub mod antigravity;
pub mod kiro;
pub mod kiro_frame;
pub mod qwen;
pub mod sse;
