use async_trait::async_trait;
use log::warn;
use std::sync::Arc;

use crate::dns_message::DNS_RCODE_SERVFAIL;
use crate::handler::{PolicyHandler, Query, Verdict};
use crate::upstream::Upstream;

/// Forwards every query to the upstream resolver and returns its
/// response verbatim. Sits last in the chain; never declines.
pub struct RecursiveHandler {
    upstream: Arc<dyn Upstream>,
}

impl RecursiveHandler {
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self { upstream }
    }
}

#[async_trait]
impl PolicyHandler for RecursiveHandler {
    fn name(&self) -> &'static str {
        "recursive"
    }

    async fn handle(&self, query: &Query) -> Verdict {
        match self
            .upstream
            .send_query(&query.name, query.qtype, query.qclass)
            .await
        {
            Ok(response) => Verdict::Answer(response),
            Err(e) => {
                warn!("Upstream lookup for {} failed: {e}", query.name);
                Verdict::Error(DNS_RCODE_SERVFAIL)
            }
        }
    }
}
