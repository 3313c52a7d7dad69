// Middleware for resilient service calls and guarded routes
//
// Provides per-collaborator circuit breaking and the model update credential gate

pub mod api_key;
pub mod circuit_breaker;

// Re-export commonly used types
pub use api_key::{require_api_key, ApiKeyGate, API_KEY_HEADER};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
