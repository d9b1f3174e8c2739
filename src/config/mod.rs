pub mod gateway;

pub use gateway::{Environment, GatewayConfig, RateLimitSettings, ServiceEndpoints};
