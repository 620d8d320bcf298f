//! # Reverse Proxy
//!
//! Forwards one inbound request to one chosen backend and brings the response
//! back. Backend selection, breaking and rate limiting happen before this
//! layer is reached.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod headers;
pub mod reverse_proxy;

pub use reverse_proxy::{ProxyRequest, ProxyResponse, ReverseProxy};

/// How the inbound path maps onto the backend path
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PathRewrite {
    /// Forward the path unchanged
    #[default]
    Preserve,
    /// Drop a leading prefix
    StripPrefix { prefix: String },
    /// Swap a leading prefix for another
    ReplacePrefix { from: String, to: String },
}

impl PathRewrite {
    /// Rewrite `path`; prefixes only match on whole path segments
    pub fn apply(&self, path: &str) -> String {
        let rewritten = match self {
            PathRewrite::Preserve => return path.to_string(),
            PathRewrite::StripPrefix { prefix } => match strip_segment_prefix(path, prefix) {
                Some(rest) => rest.to_string(),
                None => return path.to_string(),
            },
            PathRewrite::ReplacePrefix { from, to } => match strip_segment_prefix(path, from) {
                Some(rest) => format!("{}{}", to.trim_end_matches('/'), rest),
                None => return path.to_string(),
            },
        };

        if rewritten.starts_with('/') {
            rewritten
        } else {
            format!("/{}", rewritten)
        }
    }
}

fn strip_segment_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let prefix = prefix.trim_end_matches('/');
    let rest = path.strip_prefix(prefix)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

/// Per-service forwarding settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Deadline for each attempt
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Extra attempts after a transport failure
    pub retries: u32,

    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    pub path_rewrite: PathRewrite,

    /// Headers set on every forwarded request
    pub add_headers: BTreeMap<String, String>,

    /// Headers stripped from every forwarded request
    pub remove_headers: Vec<String>,
}

impl ProxyConfig {
    /// Longest time one forwarded request can take with every retry used
    pub fn worst_case_duration(&self) -> Duration {
        self.timeout
            .saturating_mul(self.retries.saturating_add(1))
            .saturating_add(self.retry_delay.saturating_mul(self.retries))
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: 2,
            retry_delay: Duration::from_millis(100),
            path_rewrite: PathRewrite::Preserve,
            add_headers: BTreeMap::new(),
            remove_headers: Vec::new(),
        }
    }
}
