//! Request accounting.
//!
//! Every HTTP request is registered with the collector before it runs and
//! completed after. A response with status >= 400 counts as an error. A
//! request whose future is dropped (client went away) is completed as an
//! error so it never lingers in the active set.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use gatemesh_core::wire::FROM_PEER_HEADER;
use gatemesh_services::metrics;
use gatemesh_services::Collector;

pub async fn track_requests(
    State(collector): State<Arc<Collector>>,
    req: Request,
    next: Next,
) -> Response {
    let from_peer = req.headers().contains_key(FROM_PEER_HEADER);
    let tracked = metrics::Request::new(req.method().as_str(), req.uri().path(), from_peer);
    let mut guard = InFlight {
        collector,
        id: tracked.id.clone(),
        done: false,
    };
    guard.collector.start_request(tracked);

    let resp = next.run(req).await;
    guard.finish(resp.status().as_u16() >= 400);
    resp
}

struct InFlight {
    collector: Arc<Collector>,
    id: String,
    done: bool,
}

impl InFlight {
    fn finish(&mut self, is_error: bool) {
        self.collector.finish_request(&self.id, is_error);
        self.done = true;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.done {
            tracing::debug!(request_id = %self.id, "request dropped before completion");
            self.collector.finish_request(&self.id, true);
        }
    }
}
