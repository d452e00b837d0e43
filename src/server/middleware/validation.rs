use std::sync::Arc;
use tracing::warn;

use crate::server::filter::{BeforeFilter, FilterFuture};
use crate::server::message::{Message, RouteRecord};
use crate::server::session::Session;
use crate::utils::error::ServerError;

/// Before-filter that bounds the serialized body size of inbound frames.
pub struct BodySizeFilter {
    max_bytes: usize,
}

impl BodySizeFilter {
    pub fn new(max_bytes: usize) -> Self {
        BodySizeFilter { max_bytes }
    }
}

impl BeforeFilter for BodySizeFilter {
    fn filter(&self, route: &RouteRecord, msg: &Message, session: &Arc<Session>) -> FilterFuture {
        let size = serde_json::to_vec(&msg.body).map(|b| b.len()).unwrap_or(0);
        let ok = size <= self.max_bytes;
        if !ok {
            warn!(
                session = %session.id,
                route = %route.route,
                size,
                max = self.max_bytes,
                "message body too large"
            );
        }
        Box::pin(async move {
            if ok {
                Ok(())
            } else {
                Err(ServerError::Filter("message too long".into()))
            }
        })
    }
}
