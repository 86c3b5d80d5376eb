#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashMap};
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    use crate::blacklist::BlacklistHandler;
    use crate::censor::CensorLearn;
    use crate::dns_message::{
        RData, ResourceRecord, Response, DNS_CLASS_IN, DNS_RCODE_NOERROR, DNS_RCODE_NXDOMAIN,
        DNS_RCODE_SERVFAIL, DNS_TYPE_A, DNS_TYPE_NS,
    };
    use crate::domain_trie::{self, DomainTrie, SharedTrie};
    use crate::errors::{DnsError, DnsResult};
    use crate::handler::{HandlerChain, PolicyHandler, Query, Verdict};
    use crate::pipeline::QueryPipeline;
    use crate::recursive::RecursiveHandler;
    use crate::template::ZoneTemplates;
    use crate::upstream::Upstream;
    use crate::whitelist::WhitelistHandler;

    /// Serves canned responses by query name; unknown names get NXDOMAIN
    struct MockUpstream {
        responses: HashMap<String, Response>,
        fail: bool,
    }

    impl MockUpstream {
        fn new() -> Self {
            Self {
                responses: HashMap::new(),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                responses: HashMap::new(),
                fail: true,
            }
        }

        fn with(mut self, qname: &str, response: Response) -> Self {
            self.responses.insert(qname.to_string(), response);
            self
        }
    }

    #[async_trait]
    impl Upstream for MockUpstream {
        async fn send_query(&self, qname: &str, _qtype: u16, _qclass: u16) -> DnsResult<Response> {
            if self.fail {
                return Err(DnsError::UpstreamTimeout);
            }
            Ok(self
                .responses
                .get(qname)
                .cloned()
                .unwrap_or_else(|| Response::with_rcode(DNS_RCODE_NXDOMAIN)))
        }
    }

    fn a_rr(name: &str, addr: [u8; 4]) -> ResourceRecord {
        ResourceRecord {
            name: name.to_string(),
            rtype: DNS_TYPE_A,
            class: DNS_CLASS_IN,
            ttl: 3600,
            rdata: RData::A(Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3])),
        }
    }

    fn ns_rr(zone: &str, target: &str) -> ResourceRecord {
        ResourceRecord {
            name: zone.to_string(),
            rtype: DNS_TYPE_NS,
            class: DNS_CLASS_IN,
            ttl: 3600,
            rdata: RData::Ns(target.to_string()),
        }
    }

    fn sinkhole_templates() -> Arc<ZoneTemplates> {
        let mut records = BTreeMap::new();
        records.insert("A".to_string(), "* 86400 IN A 10.1.2.3".to_string());
        records.insert(
            "NS".to_string(),
            "* 86400 IN NS ns.sinkhole.example.com".to_string(),
        );
        Arc::new(ZoneTemplates::from_config(&records).unwrap())
    }

    /// The §8 reference policy: blacklist dyndns.org and the sinkhole
    /// nameserver's own zone, whitelist microsoft.com
    fn policy_tries() -> (SharedTrie, SharedTrie) {
        let whitelist = {
            let mut trie = DomainTrie::new();
            trie.add("microsoft.com", None).unwrap();
            domain_trie::shared(trie)
        };
        let blacklist = {
            let mut trie = DomainTrie::new();
            trie.add("dyndns.org", Some(sinkhole_templates())).unwrap();
            trie.add("ns.sinkhole.example.com", Some(sinkhole_templates()))
                .unwrap();
            domain_trie::shared(trie)
        };
        (whitelist, blacklist)
    }

    fn pipeline(
        upstream: Arc<dyn Upstream>,
        with_recursive: bool,
        auto_whitelist: bool,
        auto_blacklist: bool,
    ) -> QueryPipeline {
        let (whitelist, blacklist) = policy_tries();
        let mut handlers: Vec<Arc<dyn PolicyHandler>> = vec![
            Arc::new(WhitelistHandler::new(whitelist.clone(), upstream.clone())),
            Arc::new(BlacklistHandler::new(blacklist.clone())),
        ];
        if with_recursive {
            handlers.push(Arc::new(RecursiveHandler::new(upstream)));
        }
        QueryPipeline::new(
            HandlerChain::new(handlers),
            CensorLearn::new(whitelist, blacklist, auto_whitelist, auto_blacklist),
            Duration::from_secs(10),
        )
    }

    fn a_query(name: &str) -> Query {
        Query::new(name, DNS_TYPE_A, DNS_CLASS_IN)
    }

    #[tokio::test]
    async fn test_blacklisted_subdomain_is_sinkholed() {
        let pipeline = pipeline(Arc::new(MockUpstream::new()), true, false, false);
        let response = pipeline.resolve(&a_query("mtfnpy.dyndns.org")).await;

        assert_eq!(response.rcode, DNS_RCODE_NOERROR);
        assert_eq!(
            response.answer,
            vec![ResourceRecord {
                name: "mtfnpy.dyndns.org".to_string(),
                rtype: DNS_TYPE_A,
                class: DNS_CLASS_IN,
                ttl: 86400,
                rdata: RData::A(Ipv4Addr::new(10, 1, 2, 3)),
            }]
        );
        assert_eq!(response.authority.len(), 1);
        assert_eq!(response.authority[0].name, "dyndns.org");
        assert_eq!(
            response.authority[0].rdata,
            RData::Ns("ns.sinkhole.example.com".to_string())
        );
        assert_eq!(response.additional.len(), 1);
        assert_eq!(response.additional[0].name, "ns.sinkhole.example.com");
        assert_eq!(
            response.additional[0].rdata,
            RData::A(Ipv4Addr::new(10, 1, 2, 3))
        );
    }

    #[tokio::test]
    async fn test_blacklisted_apex_is_sinkholed() {
        let pipeline = pipeline(Arc::new(MockUpstream::new()), true, false, false);
        let response = pipeline.resolve(&a_query("dyndns.org")).await;

        assert_eq!(response.rcode, DNS_RCODE_NOERROR);
        assert_eq!(response.answer[0].name, "dyndns.org");
    }

    #[tokio::test]
    async fn test_recursive_passthrough_scrubs_foreign_glue() {
        let upstream = MockUpstream::new().with("mtfnpy.org", {
            let mut r = Response::with_rcode(DNS_RCODE_NOERROR);
            r.ra = true;
            r.answer.push(a_rr("mtfnpy.org", [93, 184, 216, 34]));
            r.authority.push(ns_rr("mtfnpy.org", "ns1.realdns.example"));
            r.additional.push(a_rr("ns1.realdns.example", [192, 0, 2, 53]));
            r
        });
        let pipeline = pipeline(Arc::new(upstream), true, false, false);

        let response = pipeline.resolve(&a_query("mtfnpy.org")).await;

        assert_eq!(response.rcode, DNS_RCODE_NOERROR);
        assert_eq!(response.answer.len(), 1);
        assert_eq!(response.answer[0].name, "mtfnpy.org");
        assert!(response.authority.is_empty());
        assert!(response.additional.is_empty());
    }

    #[tokio::test]
    async fn test_whitelisted_zone_keeps_answer_drops_glue() {
        let upstream = MockUpstream::new().with("www.microsoft.com", {
            let mut r = Response::with_rcode(DNS_RCODE_NOERROR);
            r.ra = true;
            r.answer.push(a_rr("www.microsoft.com", [104, 86, 182, 10]));
            r.authority.push(ns_rr("microsoft.com", "ns1.msft.net"));
            r.additional.push(a_rr("ns1.msft.net", [208, 84, 0, 53]));
            r
        });
        let pipeline = pipeline(Arc::new(upstream), true, false, false);

        let response = pipeline.resolve(&a_query("www.microsoft.com")).await;

        assert_eq!(response.rcode, DNS_RCODE_NOERROR);
        assert_eq!(response.answer.len(), 1);
        assert!(response.authority.is_empty());
        assert!(response.additional.is_empty());
    }

    #[tokio::test]
    async fn test_whitelisted_zone_upstream_failure_is_servfail() {
        let pipeline = pipeline(Arc::new(MockUpstream::failing()), true, false, false);
        let response = pipeline.resolve(&a_query("www.microsoft.com")).await;

        assert_eq!(response.rcode, DNS_RCODE_SERVFAIL);
    }

    #[tokio::test]
    async fn test_no_recursive_handler_yields_nxdomain() {
        let pipeline = pipeline(Arc::new(MockUpstream::new()), false, false, false);
        let response = pipeline.resolve(&a_query("www.richardharman.com")).await;

        assert_eq!(response.rcode, DNS_RCODE_NXDOMAIN);
        assert!(response.answer.is_empty());
        assert!(response.authority.is_empty());
        assert!(response.additional.is_empty());
    }

    #[tokio::test]
    async fn test_auto_blacklist_learns_and_reprocesses() {
        // Upstream delegates new.zone to the sinkhole nameserver; with
        // AutoBlacklist on, the final answer must come from the cloned
        // blacklist entry instead of the upstream data
        let upstream = MockUpstream::new().with("host.new.zone", {
            let mut r = Response::with_rcode(DNS_RCODE_NOERROR);
            r.answer.push(a_rr("host.new.zone", [198, 51, 100, 7]));
            r.authority.push(ns_rr("new.zone", "ns.sinkhole.example.com"));
            r
        });
        let pipeline = pipeline(Arc::new(upstream), true, false, true);

        let response = pipeline.resolve(&a_query("host.new.zone")).await;

        assert_eq!(response.rcode, DNS_RCODE_NOERROR);
        assert_eq!(
            response.answer[0].rdata,
            RData::A(Ipv4Addr::new(10, 1, 2, 3))
        );
        assert_eq!(response.authority[0].name, "new.zone");
        assert_eq!(
            response.authority[0].rdata,
            RData::Ns("ns.sinkhole.example.com".to_string())
        );
    }

    /// A handler that names a freshly invented zone, delegated to the
    /// sinkhole nameserver, on every invocation. Left unbounded this
    /// would make the censor ask for reprocessing forever.
    struct EndlessDelegations {
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl PolicyHandler for EndlessDelegations {
        fn name(&self) -> &'static str {
            "endless"
        }

        async fn handle(&self, _query: &Query) -> Verdict {
            let mut calls = self.calls.lock().await;
            *calls += 1;
            let mut response = Response::with_rcode(DNS_RCODE_NOERROR);
            response
                .authority
                .push(ns_rr(&format!("zone{calls}.test"), "ns.sinkhole.example.com"));
            Verdict::Answer(response)
        }
    }

    #[tokio::test]
    async fn test_reprocess_is_bounded_to_one_restart() {
        let (whitelist, blacklist) = policy_tries();
        let handler = Arc::new(EndlessDelegations {
            calls: Mutex::new(0),
        });
        let pipeline = QueryPipeline::new(
            HandlerChain::new(vec![handler.clone()]),
            CensorLearn::new(whitelist, blacklist, false, true),
            Duration::from_secs(10),
        );

        pipeline.resolve(&a_query("anything.test")).await;

        assert_eq!(*handler.calls.lock().await, 2);
    }

    struct SlowUpstream;

    #[async_trait]
    impl Upstream for SlowUpstream {
        async fn send_query(&self, _: &str, _: u16, _: u16) -> DnsResult<Response> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Response::with_rcode(DNS_RCODE_NOERROR))
        }
    }

    #[tokio::test]
    async fn test_pipeline_deadline_yields_servfail() {
        let (whitelist, blacklist) = policy_tries();
        let pipeline = QueryPipeline::new(
            HandlerChain::new(vec![Arc::new(RecursiveHandler::new(Arc::new(SlowUpstream)))]),
            CensorLearn::new(whitelist, blacklist, false, false),
            Duration::from_millis(50),
        );

        let response = pipeline.resolve(&a_query("slow.example")).await;
        assert_eq!(response.rcode, DNS_RCODE_SERVFAIL);
    }

    #[tokio::test]
    async fn test_uppercase_query_matches_policy() {
        let pipeline = pipeline(Arc::new(MockUpstream::new()), true, false, false);
        let response = pipeline.resolve(&a_query("MTFNPY.DynDNS.ORG")).await;

        assert_eq!(response.rcode, DNS_RCODE_NOERROR);
        assert_eq!(response.answer[0].name, "mtfnpy.dyndns.org");
    }
}
