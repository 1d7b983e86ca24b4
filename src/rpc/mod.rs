// ============================================================================
// Resilient RPC
// ============================================================================
//
// Outbound request/response calls over the broker:
// - errors     - CallError (transport-level tags) and ServiceError (local kinds)
// - classifier - which CallErrors are worth retrying
// - call       - timeout + fixed-delay retry around one call
// - translator - CallError → ServiceError
// - proxy      - breaker + call + translation per dependency
//
// ============================================================================

pub mod call;
pub mod classifier;
pub mod errors;
pub mod proxy;
pub mod translator;

pub use call::{resilient_call, CallOptions, ResilientCall};
pub use classifier::is_retriable;
pub use errors::{CallError, RemoteErrorBody, ServiceError};
pub use proxy::{DependencyHealth, InvokeOptions, ProxyRegistry, ResilienceConfig, ResilientServiceProxy};
pub use translator::translate;
