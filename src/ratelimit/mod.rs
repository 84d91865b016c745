//! Rate limiting policies and the limiter facade.

mod key;
mod limiter;
mod options;
mod policy;
mod window;

pub use key::{EffectiveKey, PREFIX_SEPARATOR};
pub use limiter::RateLimiter;
pub use options::{LimitOptions, RateLimitResult};
pub use policy::{Algorithm, TokenBucket, WindowPolicy};
pub use window::{window_millis, window_seconds, TimeUnit};
