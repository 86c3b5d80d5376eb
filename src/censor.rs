use log::{debug, info, warn};
use std::sync::Arc;

use crate::dns_message::{RData, ResourceRecord};
use crate::domain_trie::SharedTrie;
use crate::stats::SharedStats;

/// Inspects a response's delegation data after the handler chain has
/// spoken: scrubs glue that would leak real nameservers to the client,
/// and extends the whitelist/blacklist when the delegation connects a
/// known nameserver to a new zone (or vice versa).
pub struct CensorLearn {
    whitelist: SharedTrie,
    blacklist: SharedTrie,
    auto_whitelist: bool,
    auto_blacklist: bool,
    stats: Option<Arc<SharedStats>>,
}

/// Extracts the (zone, nameserver) pair a delegation-shaped record
/// asserts: NS owner/nsdname, or SOA owner/mname
fn delegation(rr: &ResourceRecord) -> Option<(String, String)> {
    match &rr.rdata {
        RData::Ns(target) => Some((rr.name.clone(), target.clone())),
        RData::Soa { mname, .. } => Some((rr.name.clone(), mname.clone())),
        _ => None,
    }
}

impl CensorLearn {
    pub fn new(
        whitelist: SharedTrie,
        blacklist: SharedTrie,
        auto_whitelist: bool,
        auto_blacklist: bool,
    ) -> Self {
        Self {
            whitelist,
            blacklist,
            auto_whitelist,
            auto_blacklist,
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: Arc<SharedStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Applies the cross-check matrix to every delegation record in
    /// AUTHORITY, mutating the sections in place. Returns whether the
    /// caller must re-run the handler chain because a policy set grew.
    ///
    /// This never fails the request: anything inconsistent is logged and
    /// treated as no action.
    pub async fn inspect(
        &self,
        authority: &mut Vec<ResourceRecord>,
        additional: &mut Vec<ResourceRecord>,
    ) -> bool {
        let mut reprocess = false;

        for idx in 0..authority.len() {
            let Some((zone, ns)) = delegation(&authority[idx]) else {
                continue;
            };

            let (wl_zn_anc, wl_ns_anc) = {
                let whitelist = self.whitelist.read().await;
                (
                    whitelist.first_match(&zone).map(|(key, _)| key),
                    whitelist.first_match(&ns).map(|(key, _)| key),
                )
            };
            let (bl_zn_anc, bl_ns_anc) = {
                let blacklist = self.blacklist.read().await;
                (
                    blacklist.first_match(&zone).map(|(key, _)| key),
                    blacklist.first_match(&ns).map(|(key, _)| key),
                )
            };

            if wl_zn_anc.is_some() && wl_ns_anc.is_none() {
                // The whitelist handler already stripped the glue; this
                // only deserves an operator's attention
                warn!("Whitelisted zone {zone} is served by non-whitelisted nameserver {ns}");
            } else if wl_zn_anc.is_none() && wl_ns_anc.is_some() && self.auto_whitelist {
                let src = wl_ns_anc.unwrap();
                info!("Whitelisting zone {zone}: served by whitelisted nameserver {ns} ({src})");
                let mut whitelist = self.whitelist.write().await;
                match whitelist.clone_record(&src, &zone) {
                    Ok(()) => {
                        if let Some(stats) = &self.stats {
                            stats.record_learned_whitelist().await;
                        }
                        reprocess = true;
                    }
                    Err(e) => warn!("Failed to extend whitelist with {zone}: {e}"),
                }
            } else if bl_ns_anc.is_some() && bl_zn_anc.is_none() && self.auto_blacklist {
                let src = bl_ns_anc.unwrap();
                info!("Blacklisting zone {zone}: served by blacklisted nameserver {ns} ({src})");
                let mut blacklist = self.blacklist.write().await;
                match blacklist.clone_record(&src, &zone) {
                    Ok(()) => {
                        if let Some(stats) = &self.stats {
                            stats.record_learned_blacklist().await;
                        }
                        reprocess = true;
                    }
                    Err(e) => warn!("Failed to extend blacklist with {zone}: {e}"),
                }
            } else if bl_ns_anc.is_none() && bl_zn_anc.is_some() && self.auto_blacklist {
                let src = bl_zn_anc.unwrap();
                info!("Blacklisting nameserver {ns}: serves blacklisted zone {zone} ({src})");
                let mut blacklist = self.blacklist.write().await;
                match blacklist.clone_record(&src, &ns) {
                    Ok(()) => {
                        if let Some(stats) = &self.stats {
                            stats.record_learned_blacklist().await;
                        }
                        reprocess = true;
                    }
                    Err(e) => warn!("Failed to extend blacklist with {ns}: {e}"),
                }
            } else if wl_zn_anc.is_none()
                && wl_ns_anc.is_none()
                && bl_zn_anc.is_none()
                && bl_ns_anc.is_none()
            {
                // Neither policy claims this delegation: the records name
                // real upstream servers the client must not learn about
                debug!("Scrubbing delegation for {zone} ({ns}): no policy covers it");
                authority.clear();
                additional.clear();
                if let Some(stats) = &self.stats {
                    stats.record_scrubbed().await;
                }
                break;
            }
        }

        reprocess
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns_message::{DNS_CLASS_IN, DNS_TYPE_A, DNS_TYPE_NS};
    use crate::domain_trie::{self, DomainTrie};
    use crate::template::ZoneTemplates;
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;

    fn ns_record(zone: &str, target: &str) -> ResourceRecord {
        ResourceRecord {
            name: zone.to_string(),
            rtype: DNS_TYPE_NS,
            class: DNS_CLASS_IN,
            ttl: 86400,
            rdata: RData::Ns(target.to_string()),
        }
    }

    fn a_record(name: &str) -> ResourceRecord {
        ResourceRecord {
            name: name.to_string(),
            rtype: DNS_TYPE_A,
            class: DNS_CLASS_IN,
            ttl: 86400,
            rdata: RData::A(Ipv4Addr::new(192, 0, 2, 1)),
        }
    }

    fn templates() -> Arc<ZoneTemplates> {
        let mut records = BTreeMap::new();
        records.insert("A".to_string(), "* 86400 IN A 10.1.2.3".to_string());
        records.insert(
            "NS".to_string(),
            "* 86400 IN NS ns.sinkhole.example.com".to_string(),
        );
        Arc::new(ZoneTemplates::from_config(&records).unwrap())
    }

    fn empty_trie() -> SharedTrie {
        domain_trie::shared(DomainTrie::new())
    }

    #[tokio::test]
    async fn test_scrub_when_no_policy_claims_the_delegation() {
        let censor = CensorLearn::new(empty_trie(), empty_trie(), true, true);
        let mut authority = vec![ns_record("mtfnpy.org", "ns1.realdns.example")];
        let mut additional = vec![a_record("ns1.realdns.example")];

        let reprocess = censor.inspect(&mut authority, &mut additional).await;

        assert!(!reprocess);
        assert!(authority.is_empty());
        assert!(additional.is_empty());
    }

    #[tokio::test]
    async fn test_scrub_stops_iteration() {
        let blacklist = domain_trie::shared(DomainTrie::new());
        {
            let mut guard = blacklist.try_write().unwrap();
            guard.add("sinkholed.zone", Some(templates())).unwrap();
        }
        let censor = CensorLearn::new(empty_trie(), blacklist.clone(), false, true);

        // The first record triggers the scrub; the second would have
        // triggered a learn had it been examined
        let mut authority = vec![
            ns_record("mtfnpy.org", "ns1.realdns.example"),
            ns_record("other.zone", "ns.sinkholed.zone"),
        ];
        let mut additional = Vec::new();

        let reprocess = censor.inspect(&mut authority, &mut additional).await;

        assert!(!reprocess);
        assert!(authority.is_empty());
        assert!(blacklist.read().await.lookup("other.zone").is_none());
    }

    #[tokio::test]
    async fn test_auto_blacklist_new_zone_from_known_nameserver() {
        let blacklist = domain_trie::shared(DomainTrie::new());
        {
            let mut guard = blacklist.try_write().unwrap();
            guard
                .add("ns.sinkhole.example.com", Some(templates()))
                .unwrap();
        }
        let censor = CensorLearn::new(empty_trie(), blacklist.clone(), false, true);

        let mut authority = vec![ns_record("new.zone", "ns.sinkhole.example.com")];
        let mut additional = Vec::new();
        let reprocess = censor.inspect(&mut authority, &mut additional).await;

        assert!(reprocess);
        let guard = blacklist.read().await;
        assert_eq!(guard.lookup("new.zone"), Some("new.zone".to_string()));
        assert!(guard.lookup_data("new.zone").is_some());
        // the record itself is left alone; the re-run handles the zone
        assert_eq!(authority.len(), 1);
    }

    #[tokio::test]
    async fn test_auto_blacklist_new_nameserver_of_known_zone() {
        let blacklist = domain_trie::shared(DomainTrie::new());
        {
            let mut guard = blacklist.try_write().unwrap();
            guard.add("dyndns.org", Some(templates())).unwrap();
        }
        let censor = CensorLearn::new(empty_trie(), blacklist.clone(), false, true);

        let mut authority = vec![ns_record("dyndns.org", "ns9.fresh.example")];
        let mut additional = Vec::new();
        let reprocess = censor.inspect(&mut authority, &mut additional).await;

        assert!(reprocess);
        assert!(blacklist.read().await.lookup("ns9.fresh.example").is_some());
    }

    #[tokio::test]
    async fn test_auto_blacklist_disabled_does_nothing() {
        let blacklist = domain_trie::shared(DomainTrie::new());
        {
            let mut guard = blacklist.try_write().unwrap();
            guard
                .add("ns.sinkhole.example.com", Some(templates()))
                .unwrap();
        }
        let censor = CensorLearn::new(empty_trie(), blacklist.clone(), false, false);

        let mut authority = vec![ns_record("new.zone", "ns.sinkhole.example.com")];
        let mut additional = vec![a_record("ns.sinkhole.example.com")];
        let reprocess = censor.inspect(&mut authority, &mut additional).await;

        assert!(!reprocess);
        assert!(blacklist.read().await.lookup("new.zone").is_none());
        // the blacklist still touched the nameserver, so nothing is scrubbed
        assert_eq!(authority.len(), 1);
        assert_eq!(additional.len(), 1);
    }

    #[tokio::test]
    async fn test_auto_whitelist_new_zone_from_known_nameserver() {
        let whitelist = domain_trie::shared(DomainTrie::new());
        {
            let mut guard = whitelist.try_write().unwrap();
            guard.add("msft.net", None).unwrap();
        }
        let censor = CensorLearn::new(whitelist.clone(), empty_trie(), true, false);

        let mut authority = vec![ns_record("microsoft.com", "ns1.msft.net")];
        let mut additional = Vec::new();
        let reprocess = censor.inspect(&mut authority, &mut additional).await;

        assert!(reprocess);
        assert!(whitelist.read().await.lookup("microsoft.com").is_some());
    }

    #[tokio::test]
    async fn test_whitelisted_zone_on_foreign_nameserver_only_warns() {
        let whitelist = domain_trie::shared(DomainTrie::new());
        {
            let mut guard = whitelist.try_write().unwrap();
            guard.add("microsoft.com", None).unwrap();
        }
        let censor = CensorLearn::new(whitelist.clone(), empty_trie(), true, true);

        let mut authority = vec![ns_record("microsoft.com", "ns.elsewhere.example")];
        let mut additional = vec![a_record("ns.elsewhere.example")];
        let reprocess = censor.inspect(&mut authority, &mut additional).await;

        assert!(!reprocess);
        assert!(whitelist.read().await.lookup("ns.elsewhere.example").is_none());
        assert_eq!(authority.len(), 1);
        assert_eq!(additional.len(), 1);
    }

    #[tokio::test]
    async fn test_soa_records_are_inspected_too() {
        let censor = CensorLearn::new(empty_trie(), empty_trie(), true, true);
        let mut authority = vec![ResourceRecord {
            name: "org".to_string(),
            rtype: crate::dns_message::DNS_TYPE_SOA,
            class: DNS_CLASS_IN,
            ttl: 900,
            rdata: RData::Soa {
                mname: "a0.org.afilias-nst.info".to_string(),
                rname: "hostmaster.org".to_string(),
                serial: 1,
                refresh: 1800,
                retry: 900,
                expire: 604800,
                minimum: 86400,
            },
        }];
        let mut additional = Vec::new();

        censor.inspect(&mut authority, &mut additional).await;
        assert!(authority.is_empty());
    }
}
