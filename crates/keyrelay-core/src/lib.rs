//! Gateway runtime: client access, credential selection, the upstream HTTP
//! client and the shared application state.

pub mod access;
pub mod bootstrap;
pub mod manager;
pub mod state;
pub mod upstream_client;
pub mod usage;

pub use access::{AccessError, Allowed, ClientPrincipal, KeySource, authenticate, resolve_allowed};
pub use bootstrap::{Bootstrap, CliArgs, bootstrap, bootstrap_from_env, bootstrap_with_store};
pub use manager::{
    CallMeta, CredentialManager, FillFirst, RoundRobin, Selector, cleanup_auth_mappings,
    known_refs,
};
pub use state::{AppState, ConfigEditError, RefreshError};
pub use upstream_client::{UpstreamClientConfig, WreqUpstreamClient};
pub use usage::{UsageCounts, UsageTracker};
