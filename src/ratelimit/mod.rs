//! Rate limiting logic and state management.

mod backend;
mod classifier;
mod key;
mod limiter;
mod local;
mod shared;
mod window;

pub use backend::{Decision, WindowStore};
pub use classifier::{Classification, LimitPolicy};
pub use key::RateLimitKey;
pub use limiter::{RateLimiter, Verdict};
pub use local::LocalStore;
pub use shared::RedisStore;
pub use window::{WindowState, WINDOW};
