//! Built-in executors.
//!
//! Executors never open sockets themselves: every outbound call is an
//! `UpstreamHttpRequest` handed to the `UpstreamClient` carried by `ExecCtx`.
//! Calls to the provider's own API go through [`upstream::send_routed`] so
//! reverse-proxy routing and the ban fallback apply uniformly.

mod auth_extractor;
pub mod codex;
pub mod gemini;
mod registry;
mod session_cache;
mod sse;
mod tokenizer;
pub mod upstream;

pub use codex::CodexExecutor;
pub use gemini::GeminiExecutor;
pub use registry::builtin_executors;
pub use session_cache::SessionCache;
pub use tokenizer::TiktokenCounter;
