pub mod rate_limit;
pub mod validation;

pub use rate_limit::RateLimitFilter;
pub use validation::BodySizeFilter;
