use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;

use crate::dns_message::DNS_RCODE_SERVFAIL;
use crate::domain_trie::SharedTrie;
use crate::handler::{PolicyHandler, Query, Verdict};
use crate::upstream::Upstream;

/// Resolves whitelisted zones through the upstream resolver but returns
/// only the ANSWER section, so clients never learn the real delegation.
pub struct WhitelistHandler {
    zones: SharedTrie,
    upstream: Arc<dyn Upstream>,
}

impl WhitelistHandler {
    pub fn new(zones: SharedTrie, upstream: Arc<dyn Upstream>) -> Self {
        Self { zones, upstream }
    }
}

#[async_trait]
impl PolicyHandler for WhitelistHandler {
    fn name(&self) -> &'static str {
        "whitelist"
    }

    async fn handle(&self, query: &Query) -> Verdict {
        let matched = {
            let zones = self.zones.read().await;
            zones.first_match(&query.name).map(|(key, _)| key)
        };
        let Some(key) = matched else {
            return Verdict::Ignore;
        };
        debug!("{} matches whitelist entry {key}", query.name);

        match self
            .upstream
            .send_query(&query.name, query.qtype, query.qclass)
            .await
        {
            Ok(mut response) => {
                // Strip delegation glue; the answer is all the client gets
                response.authority.clear();
                response.additional.clear();
                response.aa = false;
                Verdict::Answer(response)
            }
            Err(e) => {
                // A known-whitelisted domain failing upstream is our
                // failure, not another handler's jurisdiction
                warn!("Upstream lookup for whitelisted {} failed: {e}", query.name);
                Verdict::Error(DNS_RCODE_SERVFAIL)
            }
        }
    }
}
