use log::{debug, error};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

use crate::handler::Query;
use crate::template::rtype_name;

/// Logs DNS queries to a file, one tab-separated line per query
#[derive(Debug, Clone)]
pub struct QueryLogger {
    inner: Arc<Mutex<Option<File>>>,
    include_timestamp: bool,
    include_client_addr: bool,
    include_query_type: bool,
    include_query_class: bool,
}

impl QueryLogger {
    /// Create a new QueryLogger. With no path, logging is disabled and
    /// `log_query` is a no-op.
    pub fn new(
        log_file_path: Option<String>,
        include_timestamp: bool,
        include_client_addr: bool,
        include_query_type: bool,
        include_query_class: bool,
    ) -> Self {
        let file = log_file_path.as_ref().and_then(|path| {
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => {
                    debug!("Opened query log file: {path}");
                    Some(file)
                }
                Err(e) => {
                    error!("Failed to open query log file {path}: {e}");
                    None
                }
            }
        });

        Self {
            inner: Arc::new(Mutex::new(file)),
            include_timestamp,
            include_client_addr,
            include_query_type,
            include_query_class,
        }
    }

    /// Append one query to the log
    pub async fn log_query(&self, client_addr: &str, query: &Query) {
        let mut guard = self.inner.lock().await;
        let Some(file) = guard.as_mut() else {
            return;
        };

        let mut fields: Vec<String> = Vec::with_capacity(5);
        if self.include_timestamp {
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            fields.push(timestamp.to_string());
        }
        if self.include_client_addr {
            fields.push(client_addr.to_string());
        }
        fields.push(query.name.clone());
        if self.include_query_type {
            fields.push(rtype_name(query.qtype));
        }
        if self.include_query_class {
            fields.push(query.qclass.to_string());
        }

        if let Err(e) = writeln!(file, "{}", fields.join("\t")) {
            error!("Failed to write to query log: {e}");
        }
    }
}
