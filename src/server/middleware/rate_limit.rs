use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::warn;

use crate::server::filter::{BeforeFilter, FilterFuture};
use crate::server::message::{Message, RouteRecord};
use crate::server::session::{Session, SessionId};
use crate::utils::error::ServerError;

type SessionLimiter = RateLimiter<SessionId, DefaultKeyedStateStore<SessionId>, DefaultClock>;

/// Before-filter that caps per-session message throughput.
///
/// Non-blocking: a frame over quota is rejected immediately rather than
/// queued, so a flooding client only hurts itself.
pub struct RateLimitFilter {
    limiter: SessionLimiter,
}

impl RateLimitFilter {
    pub fn new(per_second: NonZeroU32) -> Self {
        RateLimitFilter {
            limiter: RateLimiter::keyed(Quota::per_second(per_second)),
        }
    }
}

impl BeforeFilter for RateLimitFilter {
    fn filter(&self, route: &RouteRecord, _msg: &Message, session: &Arc<Session>) -> FilterFuture {
        let allowed = self.limiter.check_key(&session.id).is_ok();
        if !allowed {
            warn!(session = %session.id, route = %route.route, "rate limit exceeded");
        }
        Box::pin(async move {
            if allowed {
                Ok(())
            } else {
                Err(ServerError::RateLimitExceeded)
            }
        })
    }
}
