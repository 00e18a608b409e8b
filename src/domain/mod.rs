pub mod backend;
pub mod health;
pub mod namespace;
pub mod routing;

pub use backend::{Backend, BackendSource, GithubSpec, ProcessConfig, Route, RouteStrategy};
pub use health::{CircuitBreakerSettings, CircuitState, HealthCheckSettings, HealthState};
pub use routing::RoutingDecision;
