//! Core abstractions for keyrelay.
//!
//! This crate does **not** depend on axum or any concrete HTTP client.
//! Executors build `UpstreamHttpRequest` values and hand them to an
//! `UpstreamClient` supplied by a higher layer.

pub mod config;
pub mod cooldown;
pub mod credential;
pub mod errors;
pub mod executor;
pub mod headers;
pub mod routing;
pub mod translate;
pub mod upstream;

pub use config::{ReverseProxy, RuntimeConfig, normalize_api_key_auth, normalize_routing_map};
pub use cooldown::{CooldownHint, QuotaSection, merge_hint, recover_at, retry_after};
pub use credential::{Credential, CredentialStatus, CredentialStore, stable_index};
pub use errors::{ExecResult, ExecutorError};
pub use executor::{ExecCtx, ExecRequest, ExecResponse, ExecStream, Executor, Format};
pub use headers::{Headers, header_get, header_remove, header_set, header_set_if_absent};
pub use routing::{DEFAULT_BAN_TTL, ReverseProxyRouter, RouteResolution, should_ban};
pub use translate::{IdentityTranslator, TokenCounter, Translator};
pub use upstream::{
    ByteStream, HttpMethod, UpstreamBody, UpstreamClient, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse, UpstreamTransportErrorKind,
};
