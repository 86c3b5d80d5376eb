use async_trait::async_trait;
use log::{debug, error, warn};

use crate::dns_message::{
    RData, Response, DNS_RCODE_NOERROR, DNS_RCODE_NXDOMAIN, DNS_RCODE_SERVFAIL, DNS_TYPE_A,
    DNS_TYPE_NS,
};
use crate::domain_trie::SharedTrie;
use crate::handler::{PolicyHandler, Query, Verdict};
use crate::template::rtype_name;

/// Synthesizes sinkhole answers for blacklisted zones from their record
/// templates, plus NS and A glue that keeps clients coming back here.
pub struct BlacklistHandler {
    zones: SharedTrie,
}

impl BlacklistHandler {
    pub fn new(zones: SharedTrie) -> Self {
        Self { zones }
    }
}

#[async_trait]
impl PolicyHandler for BlacklistHandler {
    fn name(&self) -> &'static str {
        "blacklist"
    }

    async fn handle(&self, query: &Query) -> Verdict {
        let zones = self.zones.read().await;
        let Some((zone_key, payload)) = zones.first_match(&query.name) else {
            return Verdict::Ignore;
        };
        debug!("{} matches blacklist entry {zone_key}", query.name);

        let Some(templates) = payload else {
            error!("Blacklist entry {zone_key} carries no record templates");
            return Verdict::Error(DNS_RCODE_SERVFAIL);
        };

        let Some(template) = templates.get(query.qtype) else {
            // The zone exists but has no record of this type, just like a
            // real zone would report
            debug!(
                "Blacklist zone {zone_key} has no {} template, answering NXDOMAIN for {}",
                rtype_name(query.qtype),
                query.name
            );
            return Verdict::Answer(Response::with_rcode(DNS_RCODE_NXDOMAIN));
        };

        let mut response = Response::with_rcode(DNS_RCODE_NOERROR);
        response.answer.push(template.instantiate(&query.name));

        let Some(ns_template) = templates.get(DNS_TYPE_NS) else {
            error!("Blacklist entry {zone_key} is missing its NS template");
            return Verdict::Error(DNS_RCODE_SERVFAIL);
        };
        // The matched key may be the wildcard twin; the authority owner
        // must not carry a literal asterisk
        let zone_name = zone_key.strip_prefix("*.").unwrap_or(&zone_key);
        let authority = ns_template.instantiate(zone_name);
        let ns_target = match &authority.rdata {
            RData::Ns(target) => target.clone(),
            other => {
                error!("NS template for {zone_key} produced non-NS data: {other:?}");
                return Verdict::Error(DNS_RCODE_SERVFAIL);
            }
        };
        response.authority.push(authority);

        // Glue: the sinkhole nameserver's address comes from whichever
        // blacklist zone covers it (configuration guarantees one does)
        let glue = zones
            .first_match(&ns_target)
            .and_then(|(_, payload)| payload)
            .and_then(|templates| templates.get(DNS_TYPE_A).map(|t| t.instantiate(&ns_target)));
        match glue {
            Some(rr) => response.additional.push(rr),
            None => warn!("No blacklist A template covers sinkhole nameserver {ns_target}"),
        }

        Verdict::Answer(response)
    }
}
