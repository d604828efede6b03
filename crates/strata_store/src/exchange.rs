//! Inter-replica part exchange.
//!
//! The replication core only names the part it wants and where to put it;
//! byte framing belongs to the transport. Serving endpoints are registered
//! under `ReplicatedMergeTree:<replica_path>` with weak handles so that a
//! table shutting down tears its endpoint down without reference cycles.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, OnceLock, RwLock, Weak};

use anyhow::{bail, Context};
use async_trait::async_trait;

use crate::catalog::PartCatalog;

pub const ENDPOINT_PREFIX: &str = "ReplicatedMergeTree:";

pub fn endpoint_name(replica_path: &str) -> String {
    format!("{ENDPOINT_PREFIX}{replica_path}")
}

/// Client side of the part transport.
#[async_trait]
pub trait PartExchange: Send + Sync {
    /// Download every file of `part_name` from the peer endpoint into the
    /// `dest` directory (created by the implementation).
    async fn fetch_part(
        &self,
        endpoint: &str,
        host: &str,
        port: u16,
        part_name: &str,
        dest: &Path,
    ) -> anyhow::Result<()>;
}

type EndpointRegistry = HashMap<String, Weak<PartCatalog>>;

static ENDPOINTS: OnceLock<RwLock<EndpointRegistry>> = OnceLock::new();

fn endpoints() -> &'static RwLock<EndpointRegistry> {
    ENDPOINTS.get_or_init(|| RwLock::new(HashMap::new()))
}

pub(crate) fn register_endpoint(name: String, catalog: &Arc<PartCatalog>) {
    if let Ok(mut registry) = endpoints().write() {
        registry.insert(name, Arc::downgrade(catalog));
    }
}

pub(crate) fn unregister_endpoint(name: &str) {
    if let Ok(mut registry) = endpoints().write() {
        registry.remove(name);
    }
}

/// In-process exchange for tests and embedded multi-replica setups: resolves
/// the endpoint through the process-global registry and copies the part
/// directory file by file. The host/port pair is carried but unused.
pub struct LocalExchange;

#[async_trait]
impl PartExchange for LocalExchange {
    async fn fetch_part(
        &self,
        endpoint: &str,
        _host: &str,
        _port: u16,
        part_name: &str,
        dest: &Path,
    ) -> anyhow::Result<()> {
        let catalog = {
            let registry = endpoints()
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            registry.get(endpoint).and_then(Weak::upgrade)
        };
        let Some(catalog) = catalog else {
            bail!("endpoint {endpoint} is not serving");
        };

        let source = catalog.part_dir(part_name);
        if !source.is_dir() {
            bail!("peer endpoint {endpoint} has no part {part_name}");
        }

        fs::create_dir_all(dest)
            .with_context(|| format!("creating fetch directory {}", dest.display()))?;
        for dir_entry in fs::read_dir(&source)? {
            let dir_entry = dir_entry?;
            let file_name = dir_entry.file_name();
            fs::copy(dir_entry.path(), dest.join(&file_name)).with_context(|| {
                format!(
                    "copying {} of part {part_name}",
                    file_name.to_string_lossy()
                )
            })?;
        }
        Ok(())
    }
}
