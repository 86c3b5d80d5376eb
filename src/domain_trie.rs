use log::warn;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use crate::errors::{DnsError, DnsResult};
use crate::template::ZoneTemplates;

/// A policy trie shared between the handlers that read it and the
/// learning pass that extends it
pub type SharedTrie = Arc<tokio::sync::RwLock<DomainTrie>>;

pub fn shared(trie: DomainTrie) -> SharedTrie {
    Arc::new(tokio::sync::RwLock::new(trie))
}

/// Enumerates the match candidates for a name, most specific first:
/// the exact name, then progressively broader wildcards toward the TLD.
///
/// `a.b.c.d` yields `a.b.c.d, *.a.b.c.d, *.b.c.d, *.c.d, *.d`. The bare
/// root wildcard `*.` is never produced. Handlers take the first hit, so
/// the ordering is what makes the longest suffix win.
pub fn wildcard_candidates(name: &str) -> Vec<String> {
    let name = name.trim_end_matches('.').to_lowercase();
    if name.is_empty() || name == "*" {
        return Vec::new();
    }

    let mut candidates = Vec::new();
    if let Some(stripped) = name.strip_prefix("*.") {
        // Already a wildcard: only broader wildcards apply
        candidates.push(name.clone());
        let mut rest = stripped;
        while let Some(pos) = rest.find('.') {
            rest = &rest[pos + 1..];
            if rest.is_empty() {
                break;
            }
            candidates.push(format!("*.{rest}"));
        }
        return candidates;
    }

    candidates.push(name.clone());
    candidates.push(format!("*.{name}"));
    let mut rest = name.as_str();
    while let Some(pos) = rest.find('.') {
        rest = &rest[pos + 1..];
        if rest.is_empty() {
            break;
        }
        candidates.push(format!("*.{rest}"));
    }
    candidates
}

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    terminal: bool,
    payload: Option<Arc<ZoneTemplates>>,
}

/// A set of domain keys stored as a reversed-label trie.
///
/// `www.example.com` is stored as the path `com -> example -> www`, so
/// every zone under a common suffix shares its prefix nodes. Inserting a
/// key always also inserts its `*.` twin with the same payload, which is
/// what guarantees a subdomain query and the zone query agree. Lookup is
/// exact; wildcard behavior lives in [`wildcard_candidates`].
#[derive(Debug, Default)]
pub struct DomainTrie {
    root: TrieNode,
    len: usize,
}

/// Validates and canonicalizes a key: lowercase, no trailing dot, a
/// leading `*.` allowed only as the whole first label.
fn canonical_key(name: &str) -> DnsResult<String> {
    let name = name.trim_end_matches('.').to_lowercase();
    if name.is_empty() {
        return Err(DnsError::InvalidZoneKey("empty key".to_string()));
    }
    let bare = name.strip_prefix("*.").unwrap_or(&name);
    if bare.is_empty() || bare == "*" {
        return Err(DnsError::InvalidZoneKey(format!(
            "bare wildcard {name:?}"
        )));
    }
    for label in bare.split('.') {
        if label.is_empty() {
            return Err(DnsError::InvalidZoneKey(format!(
                "empty label in {name:?}"
            )));
        }
        if label.len() > 63 {
            return Err(DnsError::InvalidZoneKey(format!(
                "label too long in {name:?}"
            )));
        }
        if !label
            .bytes()
            .all(|c| c.is_ascii_alphanumeric() || c == b'-' || c == b'_')
        {
            return Err(DnsError::InvalidZoneKey(format!(
                "invalid character in {name:?}"
            )));
        }
    }
    Ok(name)
}

impl DomainTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads keys from a file, one domain per line. Empty lines and lines
    /// starting with '#' are ignored; invalid keys are logged and skipped.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut trie = Self::new();

        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if let Err(e) = trie.add(trimmed, None) {
                warn!("Skipping zone list entry {trimmed:?}: {e}");
            }
        }

        Ok(trie)
    }

    fn insert_path(&mut self, key: &str, payload: Option<Arc<ZoneTemplates>>) {
        let mut node = &mut self.root;
        for label in key.split('.').rev() {
            node = node.children.entry(label.to_string()).or_default();
        }
        if !node.terminal {
            node.terminal = true;
            self.len += 1;
        }
        if payload.is_some() {
            node.payload = payload;
        }
    }

    /// Inserts a key (and its wildcard twin) with an optional payload.
    ///
    /// Returns the canonical key. Idempotent; re-adding a key with a
    /// payload replaces the stored payload for both twins.
    pub fn add(&mut self, name: &str, payload: Option<Arc<ZoneTemplates>>) -> DnsResult<String> {
        let key = canonical_key(name)?;
        self.insert_path(&key, payload.clone());
        if !key.starts_with("*.") {
            self.insert_path(&format!("*.{key}"), payload);
        }
        Ok(key)
    }

    fn find_node(&self, name: &str) -> Option<(&TrieNode, String)> {
        let key = canonical_key(name).ok()?;
        let mut node = &self.root;
        for label in key.split('.').rev() {
            node = node.children.get(label)?;
        }
        Some((node, key))
    }

    /// Exact lookup; returns the canonical key if present
    pub fn lookup(&self, name: &str) -> Option<String> {
        let (node, key) = self.find_node(name)?;
        node.terminal.then_some(key)
    }

    /// Exact lookup of a key's payload
    pub fn lookup_data(&self, name: &str) -> Option<Arc<ZoneTemplates>> {
        let (node, _) = self.find_node(name)?;
        if node.terminal {
            node.payload.clone()
        } else {
            None
        }
    }

    /// Runs the candidate enumeration against this trie and returns the
    /// first key present, with its payload
    pub fn first_match(&self, name: &str) -> Option<(String, Option<Arc<ZoneTemplates>>)> {
        for candidate in wildcard_candidates(name) {
            if let Some((node, key)) = self.find_node(&candidate) {
                if node.terminal {
                    return Some((key, node.payload.clone()));
                }
            }
        }
        None
    }

    /// Copies the payload of `src` onto `dst` (and its wildcard twin).
    ///
    /// The payload is shared, not deep-copied, and the operation is
    /// idempotent: repeating it leaves the trie unchanged. A `src`
    /// without payload degrades to a plain insert of `dst`.
    pub fn clone_record(&mut self, src: &str, dst: &str) -> DnsResult<()> {
        let payload = self.lookup_data(src);
        self.add(dst, payload)?;
        Ok(())
    }

    /// Number of stored keys, wildcard twins included
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Serializes the trie as sorted `zone\tpayload_json` lines for
    /// operational inspection
    pub fn dump(&self) -> Vec<String> {
        fn walk(node: &TrieNode, labels: &mut Vec<String>, out: &mut Vec<String>) {
            if node.terminal {
                let name: Vec<&str> = labels.iter().rev().map(String::as_str).collect();
                let payload = node
                    .payload
                    .as_ref()
                    .map(|p| p.to_json().to_string())
                    .unwrap_or_else(|| "null".to_string());
                out.push(format!("{}\t{}", name.join("."), payload));
            }
            for (label, child) in &node.children {
                labels.push(label.clone());
                walk(child, labels, out);
                labels.pop();
            }
        }

        let mut out = Vec::with_capacity(self.len);
        walk(&self.root, &mut Vec::new(), &mut out);
        out.sort();
        out
    }
}
