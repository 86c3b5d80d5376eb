use tokio::sync::Mutex;

use crate::dns_message::{DNS_RCODE_NOERROR, DNS_RCODE_NXDOMAIN, DNS_RCODE_SERVFAIL};

/// Counters for the server, suitable for a periodic snapshot log
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    /// Queries received from clients
    pub received: u64,
    /// Responses answered NOERROR
    pub noerror: u64,
    /// Responses answered NXDOMAIN
    pub nxdomain: u64,
    /// Responses answered SERVFAIL
    pub servfail: u64,
    /// Responses with any other rcode
    pub other_rcode: u64,
    /// Whitelist entries learned from delegation data
    pub learned_whitelist: u64,
    /// Blacklist entries learned from delegation data
    pub learned_blacklist: u64,
    /// Responses whose delegation glue was scrubbed
    pub scrubbed: u64,
}

/// Shared statistics tracker
#[derive(Debug, Default)]
pub struct SharedStats {
    inner: Mutex<Snapshot>,
}

impl SharedStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_received(&self) {
        self.inner.lock().await.received += 1;
    }

    pub async fn record_rcode(&self, rcode: u8) {
        let mut stats = self.inner.lock().await;
        match rcode {
            DNS_RCODE_NOERROR => stats.noerror += 1,
            DNS_RCODE_NXDOMAIN => stats.nxdomain += 1,
            DNS_RCODE_SERVFAIL => stats.servfail += 1,
            _ => stats.other_rcode += 1,
        }
    }

    pub async fn record_learned_whitelist(&self) {
        self.inner.lock().await.learned_whitelist += 1;
    }

    pub async fn record_learned_blacklist(&self) {
        self.inner.lock().await.learned_blacklist += 1;
    }

    pub async fn record_scrubbed(&self) {
        self.inner.lock().await.scrubbed += 1;
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.inner.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters() {
        let stats = SharedStats::new();
        stats.record_received().await;
        stats.record_received().await;
        stats.record_rcode(DNS_RCODE_NOERROR).await;
        stats.record_rcode(DNS_RCODE_NXDOMAIN).await;
        stats.record_rcode(9).await;
        stats.record_learned_blacklist().await;

        let snapshot = stats.snapshot().await;
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.noerror, 1);
        assert_eq!(snapshot.nxdomain, 1);
        assert_eq!(snapshot.other_rcode, 1);
        assert_eq!(snapshot.learned_blacklist, 1);
        assert_eq!(snapshot.learned_whitelist, 0);
    }
}
