use log::{debug, error, warn};
use std::time::Duration;

use crate::censor::CensorLearn;
use crate::dns_message::{Response, DNS_RCODE_SERVFAIL};
use crate::handler::{HandlerChain, Query, RCODE_IGNORE};

/// Resolves one query end to end: handler chain, censor-and-learn, and
/// at most one re-run of the chain when learning extended a policy set.
pub struct QueryPipeline {
    chain: HandlerChain,
    censor: CensorLearn,
    deadline: Duration,
}

impl QueryPipeline {
    pub fn new(chain: HandlerChain, censor: CensorLearn, deadline: Duration) -> Self {
        Self {
            chain,
            censor,
            deadline,
        }
    }

    /// Always produces a well-formed response, whatever happens inside
    pub async fn resolve(&self, query: &Query) -> Response {
        match tokio::time::timeout(self.deadline, self.run(query)).await {
            Ok(response) => response,
            Err(_) => {
                warn!(
                    "Query for {} exceeded the {}s pipeline deadline",
                    query.name,
                    self.deadline.as_secs()
                );
                Response::with_rcode(DNS_RCODE_SERVFAIL)
            }
        }
    }

    async fn run(&self, query: &Query) -> Response {
        let mut response = Response::with_rcode(DNS_RCODE_SERVFAIL);

        // The reprocess bound is a correctness property: cloning is
        // idempotent, so a second learning pass could not change the
        // outcome, but it could loop on a bad policy cascade
        for attempt in 0..2 {
            response = self.chain.run(query).await;
            let reprocess = self
                .censor
                .inspect(&mut response.authority, &mut response.additional)
                .await;
            if !reprocess || attempt > 0 {
                break;
            }
            debug!(
                "Policy extended while resolving {}, re-running handler chain",
                query.name
            );
        }

        if response.rcode == RCODE_IGNORE {
            error!(
                "Internal IGNORE rcode reached the response builder for {}; answering SERVFAIL",
                query.name
            );
            return Response::with_rcode(DNS_RCODE_SERVFAIL);
        }
        response
    }
}
