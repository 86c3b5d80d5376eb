// Export modules that need to be accessible from integration tests
pub mod blacklist;
pub mod censor;
pub mod dns_message;
pub mod domain_trie;
pub mod errors;
pub mod handler;
pub mod pipeline;
pub mod query_logger;
pub mod recursive;
pub mod stats;
pub mod template;
pub mod upstream;
pub mod whitelist;

mod pipeline_test;

// Re-export error types for convenience
pub use errors::{DnsError, DnsResult, SinkDnsError, SinkDnsResult};
