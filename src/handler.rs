use async_trait::async_trait;
use log::debug;
use std::str::FromStr;
use std::sync::Arc;

use crate::dns_message::{Response, DNS_RCODE_NXDOMAIN};

/// Internal "this handler declines" response code. The value sits in the
/// range the protocol reserves for future use, and it must never appear
/// in a packet: the pipeline converts a leak to SERVFAIL and logs it.
pub const RCODE_IGNORE: u8 = 11;

/// A normalized question: lowercase name, no trailing dot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl Query {
    pub fn new(name: &str, qtype: u16, qclass: u16) -> Self {
        Self {
            name: name.trim_end_matches('.').to_lowercase(),
            qtype,
            qclass,
        }
    }
}

/// What a policy handler decided about a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The handler owns this query and produced a response
    Answer(Response),
    /// Not this handler's jurisdiction; ask the next one
    Ignore,
    /// The handler owns this query but failed; respond with this rcode
    Error(u8),
}

/// A policy stage in the resolution chain
#[async_trait]
pub trait PolicyHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, query: &Query) -> Verdict;
}

/// Runs handlers in configured order; the first non-Ignore verdict wins.
/// When every handler declines the chain answers NXDOMAIN.
pub struct HandlerChain {
    handlers: Vec<Arc<dyn PolicyHandler>>,
}

impl HandlerChain {
    pub fn new(handlers: Vec<Arc<dyn PolicyHandler>>) -> Self {
        Self { handlers }
    }

    pub async fn run(&self, query: &Query) -> Response {
        for handler in &self.handlers {
            match handler.handle(query).await {
                Verdict::Ignore => {
                    debug!("Handler {} ignored {}", handler.name(), query.name);
                }
                Verdict::Answer(response) => {
                    debug!("Handler {} answered {}", handler.name(), query.name);
                    return response;
                }
                Verdict::Error(rcode) => {
                    debug!(
                        "Handler {} failed {} with rcode {rcode}",
                        handler.name(),
                        query.name
                    );
                    return Response::with_rcode(rcode);
                }
            }
        }
        debug!("No handler claimed {}, answering NXDOMAIN", query.name);
        Response::with_rcode(DNS_RCODE_NXDOMAIN)
    }
}

/// Handler names accepted in the configuration's `handlers` list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Whitelist,
    Blacklist,
    Recursive,
}

impl FromStr for HandlerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "whitelist" => Ok(HandlerKind::Whitelist),
            "blacklist" => Ok(HandlerKind::Blacklist),
            "recursive" => Ok(HandlerKind::Recursive),
            other => Err(format!("unknown handler {other:?}")),
        }
    }
}
