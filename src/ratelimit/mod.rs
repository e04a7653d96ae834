//! Rate limiting logic and state management.

mod identity;
mod limiter;
mod rules;
mod window;

pub use identity::{ClientIdentity, EndpointKey, UserIdentity};
pub use limiter::{
    BlockReason, Decision, Quota, RateLimiter, RateLimiterStats, RejectReason, Rejection,
};
pub use rules::{AnomalyRules, EndpointRule, RateLimitRules};
pub use window::{Limit, RequestWindow};
