//! Period-window rate limiting.

mod key;
mod period;
mod window;

pub use key::LimitKey;
pub use period::{PeriodLimitConfig, PeriodLimitStatus, PeriodLimiter, TakeOptions};
pub use window::window_ttl;
