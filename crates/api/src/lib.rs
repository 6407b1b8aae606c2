//! HTTP surface for courier-rs.
//!
//! This crate provides the two interfaces the core exposes over HTTP:
//!
//! - **Rate limiting**: Distributed fixed-window tiers counted in the
//!   shared cache, applied as Tower middleware
//! - **Operations**: Job submission, queue counts, breaker status and
//!   manual health checks for the admin surface
//!
//! Built on Axum 0.8. Everything else about the product (CRUD, dashboards,
//! auth) lives outside the core and consumes these routes.

pub mod ops;
pub mod rate_limit;
pub mod response;

pub use ops::{OpsState, router};
pub use rate_limit::{
    DistributedRateLimiter, RateLimitDecision, RateLimitTier, RateLimiterState,
};
pub use response::{ApiError, ApiResponse};
