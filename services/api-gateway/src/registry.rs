//! Authoritative list of upstream services and the routing table derived
//! from them.
//!
//! The routing table is a trie over path segments, keyed first by host
//! scope with a wildcard bucket for globally registered prefixes. Lookups
//! are O(path depth) and lock-free beyond an `Arc` clone; reloads build a
//! fresh table off to the side and swap it in atomically, so readers never
//! observe a partial table.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use nimbus_shared::repository::ServiceRepository;
use nimbus_shared::types::ServiceId;
use nimbus_shared::upstream::UpstreamService;

use crate::error::{ApiGatewayError, ApiResult};

/// Result of a routing lookup: the matched service plus the prefix that
/// matched, needed later for prefix stripping.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub service: Arc<UpstreamService>,
    pub matched_prefix: String,
}

#[derive(Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    service: Option<Arc<UpstreamService>>,
}

impl TrieNode {
    fn insert(&mut self, segments: &[&str], service: Arc<UpstreamService>) -> ApiResult<()> {
        let mut node = self;
        for segment in segments {
            node = node.children.entry(segment.to_string()).or_default();
        }
        if let Some(existing) = &node.service {
            return Err(ApiGatewayError::ConfigInvalid {
                message: format!(
                    "services '{}' and '{}' register the same path prefix '{}'",
                    existing.id, service.id, service.path_prefix
                ),
            });
        }
        node.service = Some(service);
        Ok(())
    }

    /// Walks the trie along `segments`, remembering the deepest node that
    /// carries a service. Longest prefix wins.
    fn longest_match(&self, segments: &[&str]) -> Option<(usize, Arc<UpstreamService>)> {
        let mut node = self;
        let mut best = node.service.clone().map(|s| (0, s));
        for (depth, segment) in segments.iter().enumerate() {
            match node.children.get(*segment) {
                Some(child) => {
                    node = child;
                    if let Some(service) = &node.service {
                        best = Some((depth + 1, service.clone()));
                    }
                }
                None => break,
            }
        }
        best
    }
}

struct RouteTable {
    hosts: HashMap<String, TrieNode>,
    global: TrieNode,
    services: Vec<Arc<UpstreamService>>,
    by_id: HashMap<ServiceId, Arc<UpstreamService>>,
}

impl RouteTable {
    fn build(services: Vec<UpstreamService>) -> ApiResult<Self> {
        let mut table = Self {
            hosts: HashMap::new(),
            global: TrieNode::default(),
            services: Vec::with_capacity(services.len()),
            by_id: HashMap::new(),
        };

        for service in services {
            service.validate().map_err(|e| ApiGatewayError::ConfigInvalid {
                message: e.to_string(),
            })?;
            reqwest::Url::parse(&service.base_url).map_err(|e| {
                ApiGatewayError::ConfigInvalid {
                    message: format!(
                        "service '{}': base_url '{}' is not a valid URL: {}",
                        service.id, service.base_url, e
                    ),
                }
            })?;

            let service = Arc::new(service);
            if table
                .by_id
                .insert(service.id.clone(), service.clone())
                .is_some()
            {
                return Err(ApiGatewayError::ConfigInvalid {
                    message: format!("duplicate service id '{}'", service.id),
                });
            }

            let segments = path_segments(&service.path_prefix);
            let node = match &service.host {
                Some(host) => table
                    .hosts
                    .entry(normalize_host(host).to_string())
                    .or_default(),
                None => &mut table.global,
            };
            node.insert(&segments, service.clone())?;
            table.services.push(service);
        }

        Ok(table)
    }

    fn lookup(&self, host: &str, path: &str) -> Option<RouteMatch> {
        let segments = path_segments(path);

        // Host-scoped registrations shadow the global scope entirely.
        if let Some(node) = self.hosts.get(normalize_host(host)) {
            if let Some((depth, service)) = node.longest_match(&segments) {
                return Some(route_match(&segments, depth, service));
            }
        }
        self.global
            .longest_match(&segments)
            .map(|(depth, service)| route_match(&segments, depth, service))
    }
}

fn route_match(segments: &[&str], depth: usize, service: Arc<UpstreamService>) -> RouteMatch {
    let matched_prefix = if depth == 0 {
        "/".to_string()
    } else {
        format!("/{}", segments[..depth].join("/"))
    };
    RouteMatch {
        service,
        matched_prefix,
    }
}

fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Hosts compare case-insensitively and without the port.
fn normalize_host(host: &str) -> &str {
    let host = host.split(':').next().unwrap_or(host);
    host.trim_end_matches('.')
}

pub struct ServiceRegistry {
    source: Arc<dyn ServiceRepository>,
    table: RwLock<Arc<RouteTable>>,
}

impl ServiceRegistry {
    /// Loads the initial table from the source. Invalid configuration at
    /// startup is fatal for the caller.
    pub async fn load(source: Arc<dyn ServiceRepository>) -> ApiResult<Self> {
        let services = source.list().await?;
        let table = RouteTable::build(services)?;
        info!(services = table.services.len(), "Service registry loaded");
        Ok(Self {
            source,
            table: RwLock::new(Arc::new(table)),
        })
    }

    fn snapshot(&self) -> Arc<RouteTable> {
        self.table.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Never blocks and never errors beyond "no match".
    pub fn lookup_by_path(&self, host: &str, path: &str) -> Option<RouteMatch> {
        self.snapshot().lookup(host, path)
    }

    pub fn get(&self, id: &str) -> Option<Arc<UpstreamService>> {
        self.snapshot().by_id.get(id).cloned()
    }

    /// Read-consistent snapshot in registration order.
    pub fn list(&self) -> Vec<Arc<UpstreamService>> {
        self.snapshot().services.clone()
    }

    /// Atomic swap to a new service set. On any violation the previous
    /// table is left untouched.
    pub fn reload_with(&self, services: Vec<UpstreamService>) -> ApiResult<usize> {
        let table = RouteTable::build(services)?;
        let count = table.services.len();
        *self.table.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(table);
        info!(services = count, "Service registry reloaded");
        Ok(count)
    }

    /// Re-reads the configured source and swaps. All-or-nothing.
    pub async fn reload(&self) -> ApiResult<usize> {
        let services = self.source.list().await.map_err(|e| {
            warn!(error = %e, "Service registry reload failed reading source");
            ApiGatewayError::ConfigInvalid {
                message: e.to_string(),
            }
        })?;
        self.reload_with(services)
    }
}
