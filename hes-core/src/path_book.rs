//! # path_book
//!
//! Per-gateway routing table: primary source route and ranked alternates for
//! every known meter. Read-through cache populated from the store.

use std::collections::HashMap;

use crate::error::EngineError;
use crate::store_api::{RawPath, Store};

/// A single route to a node: an ordered list of 4-byte next-hop addresses.
/// The last entry is always the final destination; `hop_count` is
/// `hop_addresses.len() / 4` when non-empty, or `0` with a single 4-byte
/// direct-destination entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfo {
    pub hop_count: u8,
    pub hop_addresses: Vec<u8>,
}

impl PathInfo {
    pub fn final_destination(&self) -> [u8; 4] {
        let n = self.hop_addresses.len();
        let mut out = [0u8; 4];
        out.copy_from_slice(&self.hop_addresses[n - 4..n]);
        out
    }
}

/// Strips the 4-byte gateway prefix from a stored hex-path and returns the
/// remaining hop/destination address bytes (invariant of §4.2).
fn strip_gateway_prefix(raw_hex_path: &[u8]) -> Result<Vec<u8>, EngineError> {
    if raw_hex_path.len() < 4 || (raw_hex_path.len() - 4) % 4 != 0 {
        return Err(EngineError::WireFormat(crate::error::WireFormatError::LengthMismatch));
    }
    Ok(raw_hex_path[4..].to_vec())
}

fn path_info_from_raw(raw: &RawPath) -> Result<PathInfo, EngineError> {
    let hop_addresses = strip_gateway_prefix(&raw.path_bytes)?;
    let hop_count = if hop_addresses.len() == 4 {
        0
    } else {
        (hop_addresses.len() / 4 - 1) as u8
    };
    Ok(PathInfo { hop_count, hop_addresses })
}

#[derive(Debug, Default)]
struct NodeRoutes {
    primary: PathInfo,
    alternates: Vec<PathInfo>,
}

/// Per-gateway routing table.
pub struct PathBook {
    gateway_id: String,
    routes: HashMap<[u8; 8], NodeRoutes>,
    /// Preserves store return order — the scheduler iterates nodes in this order.
    order: Vec<[u8; 8]>,
}

impl PathBook {
    pub fn new(gateway_id: impl Into<String>) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            routes: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// `load(gateway_id)` — populates all `(mac -> PathInfo)` entries for
    /// non-disconnected nodes from the store.
    pub async fn load(&mut self, store: &dyn Store) -> Result<(), EngineError> {
        self.routes.clear();
        self.order.clear();

        let primaries = store.load_primary_routes(&self.gateway_id).await?;
        for row in primaries {
            let info = path_info_from_raw(&row.path)?;
            self.order.push(row.mac);
            self.routes.entry(row.mac).or_default().primary = info;
        }

        let alternates = store.load_alternate_routes(&self.gateway_id).await?;
        let mut by_node: HashMap<[u8; 8], Vec<PathInfo>> = HashMap::new();
        for row in alternates {
            let info = path_info_from_raw(&row.path)?;
            by_node.entry(row.mac).or_default().push(info);
        }
        for (mac, mut alts) in by_node {
            // primary, ascending hop-count.
            alts.sort_by_key(|p| p.hop_count);
            if let Some(entry) = self.routes.get_mut(&mac) {
                entry.alternates = alts;
            }
        }

        Ok(())
    }

    /// Node MACs in store-return order — the order the scheduler iterates.
    pub fn node_order(&self) -> &[[u8; 8]] {
        &self.order
    }

    /// Every known node's primary route, for leaf detection across the whole
    /// mesh (§4.6 `NetworkSilence`).
    pub fn all_routes(&self) -> Vec<([u8; 8], PathInfo)> {
        self.order
            .iter()
            .filter_map(|mac| self.routes.get(mac).map(|r| (*mac, r.primary.clone())))
            .collect()
    }

    pub fn primary(&self, mac: [u8; 8]) -> Option<&PathInfo> {
        self.routes.get(&mac).map(|r| &r.primary)
    }

    /// Ordered list of alternates: by hop-count ascending. When `prefer_hop_count`
    /// is given (rotating after a primary failure), alternates matching that
    /// hop-count sort first.
    pub fn alternates(&self, mac: [u8; 8], prefer_hop_count: Option<u8>) -> Vec<&PathInfo> {
        let Some(entry) = self.routes.get(&mac) else {
            return Vec::new();
        };
        let mut out: Vec<&PathInfo> = entry.alternates.iter().collect();
        if let Some(preferred) = prefer_hop_count {
            out.sort_by_key(|p| (p.hop_count != preferred, p.hop_count));
        }
        out
    }
}
