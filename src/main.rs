use clap::Parser;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

// Include our modules
mod blacklist;
mod censor;
mod dns_message;
mod domain_trie;
mod errors;
mod handler;
mod pipeline;
mod pipeline_test;
mod query_logger;
mod recursive;
mod stats;
mod template;
mod upstream;
mod whitelist;

// Use our error types
use blacklist::BlacklistHandler;
use censor::CensorLearn;
use domain_trie::{DomainTrie, SharedTrie};
use errors::{SinkDnsError, SinkDnsResult};
use handler::{HandlerChain, HandlerKind, PolicyHandler, Query};
use pipeline::QueryPipeline;
use query_logger::QueryLogger;
use recursive::RecursiveHandler;
use stats::SharedStats;
use template::ZoneTemplates;
use upstream::{UdpUpstream, Upstream};
use whitelist::WhitelistHandler;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "A DNS sinkhole server that learns")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,
}

/// One sinkholed zone with its record templates, keyed by type mnemonic
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct BlacklistZoneConfig {
    /// The zone to sinkhole
    zone: String,

    /// Record templates, e.g. A = "* 86400 IN A 10.1.2.3"
    records: BTreeMap<String, String>,
}

/// Configuration structure for the application
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    log_level: String,

    /// Addresses to listen on (array of "ip:port" strings)
    #[serde(default = "default_listen_addresses")]
    listen_addresses: Vec<String>,

    /// Maximum length of DNS packet in bytes
    #[serde(default = "default_packet_size")]
    dns_packet_len_max: usize,

    /// Maximum time (in seconds) to wait for a response from an upstream server
    #[serde(default = "default_server_timeout")]
    server_timeout: u64,

    /// Maximum time (in seconds) for one query to traverse the whole pipeline
    #[serde(default = "default_query_deadline")]
    query_deadline: u64,

    /// Upstream recursive DNS servers (array of "ip:port" strings)
    #[serde(default = "default_upstream_servers")]
    upstream_servers: Vec<String>,

    /// Policy handlers in evaluation order
    /// Options: "whitelist", "blacklist", "recursive"
    #[serde(default = "default_handlers")]
    handlers: Vec<String>,

    /// Whether to extend the whitelist when a whitelisted nameserver is
    /// found serving an unknown zone
    #[serde(default)]
    auto_whitelist: bool,

    /// Whether to extend the blacklist when delegation data connects a
    /// blacklisted nameserver or zone to an unknown one
    #[serde(default)]
    auto_blacklist: bool,

    /// Zones to resolve normally but with delegation data stripped
    #[serde(default)]
    whitelist_zones: Vec<String>,

    /// Path to a file with additional whitelist zones, one per line
    #[serde(default)]
    whitelist_zones_file: Option<String>,

    /// Zones to sinkhole, each with its record templates
    #[serde(default)]
    blacklist_zones: Vec<BlacklistZoneConfig>,

    /// The blacklist zone expected to cover the sinkhole nameserver
    /// host names referenced by the other entries' NS templates
    #[serde(default)]
    sinkhole_ns_zone: Option<String>,

    /// Path to write a dump of both policy tries after loading
    #[serde(default)]
    policy_dump_file: Option<String>,

    /// Path to a file to log DNS queries to
    /// If not set, query logging is disabled
    #[serde(default)]
    query_log_file: Option<String>,

    /// Whether to include timestamp in query log
    #[serde(default = "default_query_log_include_timestamp")]
    query_log_include_timestamp: bool,

    /// Whether to include client address in query log
    #[serde(default = "default_query_log_include_client_addr")]
    query_log_include_client_addr: bool,

    /// Whether to include query type in query log
    #[serde(default = "default_query_log_include_query_type")]
    query_log_include_query_type: bool,

    /// Whether to include query class in query log
    #[serde(default = "default_query_log_include_query_class")]
    query_log_include_query_class: bool,

    /// Interval between statistics snapshots in the log, in seconds
    /// Set to 0 to disable
    #[serde(default = "default_stats_interval")]
    stats_interval: u64,
}

// Default values for configuration
fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_addresses() -> Vec<String> {
    vec!["127.0.0.1:5252".to_string()]
}

fn default_packet_size() -> usize {
    4096
}

fn default_server_timeout() -> u64 {
    5 // 5 seconds default timeout
}

fn default_query_deadline() -> u64 {
    10 // 10 seconds for the whole pipeline, learning re-runs included
}

fn default_upstream_servers() -> Vec<String> {
    vec!["8.8.8.8:53".to_string(), "8.8.4.4:53".to_string()]
}

fn default_handlers() -> Vec<String> {
    // Whitelist precedes blacklist so a carve-out inside a blacklisted
    // parent is honored; recursive runs only when no policy applies
    vec![
        "whitelist".to_string(),
        "blacklist".to_string(),
        "recursive".to_string(),
    ]
}

fn default_query_log_include_timestamp() -> bool {
    true
}

fn default_query_log_include_client_addr() -> bool {
    true
}

fn default_query_log_include_query_type() -> bool {
    true
}

fn default_query_log_include_query_class() -> bool {
    false
}

fn default_stats_interval() -> u64 {
    60
}

impl Config {
    /// Load configuration from a TOML file
    fn from_file(path: &PathBuf) -> SinkDnsResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            SinkDnsError::ConfigReadError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| {
            SinkDnsError::ConfigParseError(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        // Validate the configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> SinkDnsResult<()> {
        // Validate log level
        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(SinkDnsError::Other(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.log_level
                )));
            }
        }

        // Check DNS packet size limits
        if self.dns_packet_len_max < 512 || self.dns_packet_len_max >= 65536 {
            return Err(SinkDnsError::Other(format!(
                "Invalid DNS packet size: {}. Must be between 512 and 65536 bytes",
                self.dns_packet_len_max
            )));
        }

        // Check timeout limits
        if self.server_timeout < 1 {
            return Err(SinkDnsError::Other(format!(
                "Invalid server_timeout: {}. Must be at least 1 second",
                self.server_timeout
            )));
        }

        if self.query_deadline < 1 {
            return Err(SinkDnsError::Other(format!(
                "Invalid query_deadline: {}. Must be at least 1 second",
                self.query_deadline
            )));
        }

        // Validate each listen address
        for addr_str in &self.listen_addresses {
            addr_str.parse::<SocketAddr>().map_err(|e| {
                SinkDnsError::Other(format!("Invalid socket address {addr_str}: {e}"))
            })?;
        }

        // Validate each upstream server address
        for addr_str in &self.upstream_servers {
            addr_str.parse::<SocketAddr>().map_err(|e| {
                SinkDnsError::Other(format!("Invalid upstream server address {addr_str}: {e}"))
            })?;
        }

        // Validate the handler list
        if self.handlers.is_empty() {
            return Err(SinkDnsError::Other(
                "No handlers configured; the server would answer NXDOMAIN to everything"
                    .to_string(),
            ));
        }
        let mut needs_upstream = false;
        for name in &self.handlers {
            let kind = name
                .parse::<HandlerKind>()
                .map_err(SinkDnsError::Other)?;
            if matches!(kind, HandlerKind::Whitelist | HandlerKind::Recursive) {
                needs_upstream = true;
            }
        }
        if needs_upstream && self.upstream_servers.is_empty() {
            return Err(SinkDnsError::Other(
                "The whitelist and recursive handlers require upstream_servers".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the socket addresses to bind to
    fn socket_addrs(&self) -> SinkDnsResult<Vec<SocketAddr>> {
        self.listen_addresses
            .iter()
            .map(|addr_str| {
                addr_str.parse::<SocketAddr>().map_err(|e| {
                    SinkDnsError::Other(format!("Invalid socket address {addr_str}: {e}"))
                })
            })
            .collect()
    }
}

/// Builds the whitelist trie from the inline zones and the optional file
fn build_whitelist(config: &Config) -> SinkDnsResult<DomainTrie> {
    let mut trie = match &config.whitelist_zones_file {
        Some(path) => DomainTrie::load_from_file(path).map_err(|e| {
            SinkDnsError::ConfigParseError(format!(
                "Failed to load whitelist zones file {path}: {e}"
            ))
        })?,
        None => DomainTrie::new(),
    };

    for zone in &config.whitelist_zones {
        if let Err(e) = trie.add(zone, None) {
            warn!("Skipping whitelist zone {zone:?}: {e}");
        }
    }

    Ok(trie)
}

/// Builds the blacklist trie and enforces the sinkhole coverage
/// invariant: every NS template target must fall inside a blacklisted
/// zone that carries an A template, so the fabricated glue always
/// points back at the sinkhole.
fn build_blacklist(config: &Config) -> SinkDnsResult<DomainTrie> {
    let mut trie = DomainTrie::new();
    let mut ns_targets: Vec<(String, String)> = Vec::new();

    for entry in &config.blacklist_zones {
        let templates = ZoneTemplates::from_config(&entry.records).map_err(|e| {
            SinkDnsError::ConfigParseError(format!("Blacklist zone {}: {e}", entry.zone))
        })?;
        if templates.is_empty() {
            return Err(SinkDnsError::ConfigParseError(format!(
                "Blacklist zone {} has no record templates",
                entry.zone
            )));
        }
        if let Some(target) = templates.ns_target() {
            ns_targets.push((entry.zone.clone(), target.to_string()));
        }
        trie.add(&entry.zone, Some(Arc::new(templates)))
            .map_err(|e| {
                SinkDnsError::ConfigParseError(format!("Blacklist zone {}: {e}", entry.zone))
            })?;
    }

    if let Some(zone) = &config.sinkhole_ns_zone {
        if trie.lookup(zone).is_none() {
            return Err(SinkDnsError::ConfigParseError(format!(
                "sinkhole_ns_zone {zone} is not a configured blacklist zone"
            )));
        }
    }

    for (zone, target) in &ns_targets {
        let covered = trie
            .first_match(target)
            .and_then(|(_, payload)| payload)
            .map(|templates| templates.get(dns_message::DNS_TYPE_A).is_some())
            .unwrap_or(false);
        if !covered {
            return Err(SinkDnsError::ConfigParseError(format!(
                "Nameserver {target} (NS template of blacklist zone {zone}) is not covered by a \
                 blacklist zone with an A template"
            )));
        }
    }

    Ok(trie)
}

/// Writes both tries as `zone\tpayload_json` lines for inspection
fn dump_policy(path: &str, whitelist: &DomainTrie, blacklist: &DomainTrie) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    writeln!(file, "# whitelist")?;
    for line in whitelist.dump() {
        writeln!(file, "{line}")?;
    }
    writeln!(file, "# blacklist")?;
    for line in blacklist.dump() {
        writeln!(file, "{line}")?;
    }
    Ok(())
}

/// Everything a listener task needs to serve one query
struct ServerState {
    pipeline: QueryPipeline,
    stats: Arc<SharedStats>,
    query_logger: QueryLogger,
    dns_packet_len_max: usize,
    server_timeout: u64,
}

/// Runs one query packet through the pipeline.
///
/// Invalid packets are dropped without a response. Oversized UDP answers
/// are replaced with a truncated response so the client retries over TCP.
async fn process_query_packet(
    state: &ServerState,
    packet: &[u8],
    client_addr: &str,
    udp: bool,
) -> Option<Vec<u8>> {
    let (tid, rd, question) = match dns_message::decode_query(packet) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("Invalid DNS packet from {client_addr}: {e}");
            debug!("Dropping invalid DNS packet without response");
            return None;
        }
    };

    state.stats.record_received().await;
    let query = Query::new(&question.name, question.qtype, question.qclass);
    state.query_logger.log_query(client_addr, &query).await;

    let response = state.pipeline.resolve(&query).await;
    state.stats.record_rcode(response.rcode).await;

    let response_data = match dns_message::encode_response(tid, rd, &question, &response) {
        Ok(data) => data,
        Err(e) => {
            error!("Failed to encode response for {}: {e}", query.name);
            return None;
        }
    };

    if udp && response_data.len() > dns_message::DNS_MAX_UDP_PACKET_SIZE {
        debug!(
            "Response for {} is {} bytes, truncating for UDP",
            query.name,
            response_data.len()
        );
        return dns_message::truncated_response(tid, rd, &question).ok();
    }

    Some(response_data)
}

/// Serves length-prefixed queries on one TCP connection until the peer
/// goes quiet or hangs up
async fn process_tcp_connection(mut stream: TcpStream, addr: SocketAddr, state: Arc<ServerState>) {
    let client_addr = addr.to_string();
    let read_timeout = Duration::from_secs(state.server_timeout);

    loop {
        let mut len_buf = [0u8; 2];
        match tokio::time::timeout(read_timeout, stream.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!("TCP client {client_addr} closed: {e}");
                return;
            }
            Err(_) => {
                debug!("TCP client {client_addr} idle, closing");
                return;
            }
        }

        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 || len > state.dns_packet_len_max {
            debug!("TCP client {client_addr} sent invalid length {len}, closing");
            return;
        }

        let mut packet = vec![0u8; len];
        match tokio::time::timeout(read_timeout, stream.read_exact(&mut packet)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!("Failed to read query from TCP client {client_addr}: {e}");
                return;
            }
            Err(_) => {
                debug!("TCP client {client_addr} stalled mid-query, closing");
                return;
            }
        }

        let Some(response) = process_query_packet(&state, &packet, &client_addr, false).await
        else {
            continue;
        };

        let mut framed = Vec::with_capacity(response.len() + 2);
        framed.extend_from_slice(&(response.len() as u16).to_be_bytes());
        framed.extend_from_slice(&response);
        if let Err(e) = stream.write_all(&framed).await {
            debug!("Failed to send response to TCP client {client_addr}: {e}");
            return;
        }
    }
}

#[tokio::main]
async fn main() -> SinkDnsResult<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration from file
    let config = Config::from_file(&args.config)?;

    // Initialize the logger with the configured log level
    let log_level = config.log_level.to_lowercase();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&log_level)).init();

    debug!("Command line arguments: {:?}", args);
    debug!("Loaded configuration: {:?}", config);

    // Log startup information at INFO level
    info!("Starting sinkdns server");
    info!("Log level: {}", config.log_level);

    for addr in &config.listen_addresses {
        info!("Listening on: {} (UDP/TCP)", addr);
    }
    info!("Upstream servers: {}", config.upstream_servers.join(", "));
    info!("Handler order: {}", config.handlers.join(" -> "));
    info!(
        "Auto-whitelist: {}, auto-blacklist: {}",
        config.auto_whitelist, config.auto_blacklist
    );

    // Build the policy tries
    let whitelist_trie = build_whitelist(&config)?;
    let blacklist_trie = build_blacklist(&config)?;
    info!(
        "Loaded {} whitelist keys and {} blacklist keys",
        whitelist_trie.len(),
        blacklist_trie.len()
    );

    // Dump the tries if configured
    if let Some(path) = &config.policy_dump_file {
        match dump_policy(path, &whitelist_trie, &blacklist_trie) {
            Ok(()) => info!("Wrote policy dump to {path}"),
            Err(e) => error!("Failed to write policy dump to {path}: {e}"),
        }
    }

    let whitelist: SharedTrie = domain_trie::shared(whitelist_trie);
    let blacklist: SharedTrie = domain_trie::shared(blacklist_trie);

    // Create global statistics tracker
    let global_stats = Arc::new(SharedStats::new());
    debug!("Created global statistics tracker");

    // Create a query logger if configured
    let query_logger = QueryLogger::new(
        config.query_log_file.clone(),
        config.query_log_include_timestamp,
        config.query_log_include_client_addr,
        config.query_log_include_query_type,
        config.query_log_include_query_class,
    );
    if let Some(log_file) = &config.query_log_file {
        info!("Query logging enabled to file: {}", log_file);
    }

    // The upstream recursive client shared by the handlers
    let upstream: Arc<dyn Upstream> = Arc::new(UdpUpstream::new(
        config.upstream_servers.clone(),
        config.server_timeout,
        config.dns_packet_len_max,
    ));

    // Build the handler chain in the configured order
    let mut handlers: Vec<Arc<dyn PolicyHandler>> = Vec::with_capacity(config.handlers.len());
    for name in &config.handlers {
        let kind = name.parse::<HandlerKind>().map_err(SinkDnsError::Other)?;
        let handler: Arc<dyn PolicyHandler> = match kind {
            HandlerKind::Whitelist => {
                Arc::new(WhitelistHandler::new(whitelist.clone(), upstream.clone()))
            }
            HandlerKind::Blacklist => Arc::new(BlacklistHandler::new(blacklist.clone())),
            HandlerKind::Recursive => Arc::new(RecursiveHandler::new(upstream.clone())),
        };
        handlers.push(handler);
    }

    let censor = CensorLearn::new(
        whitelist,
        blacklist,
        config.auto_whitelist,
        config.auto_blacklist,
    )
    .with_stats(global_stats.clone());

    let state = Arc::new(ServerState {
        pipeline: QueryPipeline::new(
            HandlerChain::new(handlers),
            censor,
            Duration::from_secs(config.query_deadline),
        ),
        stats: global_stats.clone(),
        query_logger,
        dns_packet_len_max: config.dns_packet_len_max,
        server_timeout: config.server_timeout,
    });

    // Get the socket addresses to bind to
    let socket_addrs = config.socket_addrs()?;

    // Bind to each address
    let mut udp_sockets = Vec::new();
    let mut tcp_listeners = Vec::new();
    for socket_addr in &socket_addrs {
        let udp_socket = UdpSocket::bind(socket_addr)
            .await
            .map_err(SinkDnsError::SocketBindError)?;
        info!(
            "Listening on UDP: {}",
            udp_socket
                .local_addr()
                .map_err(SinkDnsError::SocketBindError)?
        );
        udp_sockets.push(Arc::new(udp_socket));

        let tcp_listener = TcpListener::bind(socket_addr)
            .await
            .map_err(SinkDnsError::SocketBindError)?;
        info!(
            "Listening on TCP: {}",
            tcp_listener
                .local_addr()
                .map_err(SinkDnsError::SocketBindError)?
        );
        tcp_listeners.push(Arc::new(tcp_listener));
    }

    let mut tasks = Vec::new();

    // Periodic statistics snapshot
    if config.stats_interval > 0 {
        let stats = global_stats.clone();
        let interval = config.stats_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval));
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                let snapshot = stats.snapshot().await;
                info!(
                    "Stats: received={} noerror={} nxdomain={} servfail={} scrubbed={} \
                     learned_whitelist={} learned_blacklist={}",
                    snapshot.received,
                    snapshot.noerror,
                    snapshot.nxdomain,
                    snapshot.servfail,
                    snapshot.scrubbed,
                    snapshot.learned_whitelist,
                    snapshot.learned_blacklist
                );
            }
        }));
    }

    // Create a task for each UDP socket
    let dns_packet_len_max = config.dns_packet_len_max;
    for (i, socket) in udp_sockets.iter().enumerate() {
        let socket = socket.clone();
        let socket_addr = socket_addrs[i];
        let state = state.clone();

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; dns_packet_len_max];

            loop {
                debug!("Waiting for incoming UDP packets on {socket_addr}...");
                match socket.recv_from(&mut buf).await {
                    Ok((len, addr)) => {
                        debug!("Received packet of size {len} bytes from UDP client {addr}");
                        let data = buf[..len].to_vec();
                        let socket = socket.clone();
                        let state = state.clone();

                        tokio::spawn(async move {
                            let client_addr = addr.to_string();
                            let Some(response) =
                                process_query_packet(&state, &data, &client_addr, true).await
                            else {
                                return;
                            };
                            if let Err(e) = socket.send_to(&response, addr).await {
                                debug!("Failed to send response to UDP client {addr}: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to receive packet on UDP {socket_addr}: {e}");
                    }
                }
            }
        });
        tasks.push(task);
    }

    // Create a task for each TCP listener
    for (i, listener) in tcp_listeners.iter().enumerate() {
        let listener = listener.clone();
        let socket_addr = socket_addrs[i];
        let state = state.clone();

        let task = tokio::spawn(async move {
            loop {
                debug!("Waiting for incoming TCP connections on {socket_addr}...");
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("Accepted TCP connection from {addr}");
                        let state = state.clone();
                        tokio::spawn(async move {
                            process_tcp_connection(stream, addr, state).await;
                            debug!("Completed TCP connection handler for client {addr}");
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept TCP connection on {socket_addr}: {e}");
                    }
                }
            }
        });
        tasks.push(task);
    }

    // Wait for all tasks to complete (which they never will)
    for task in tasks {
        match task.await {
            Ok(_) => {}
            Err(e) => {
                error!("Task error: {e}");
                return Err(SinkDnsError::Other(format!("Task error: {e}")));
            }
        }
    }

    Ok(())
}
