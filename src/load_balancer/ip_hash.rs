//! Client-affinity strategy: a stable hash of the client key picks the instance.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::config::StrategyKind;
use crate::load_balancer::round_robin::RoundRobin;
use crate::load_balancer::{RequestContext, SelectionStrategy};
use crate::registry::BackendInstance;

/// The same key maps to the same instance while the routable set is unchanged.
/// Requests without a key fall back to round robin.
#[derive(Debug, Default)]
pub struct IpHash {
    fallback: RoundRobin,
}

impl IpHash {
    pub fn new() -> Self {
        Self::default()
    }
}

/// First eight bytes of SHA-256, big endian. Stable across processes and builds.
pub fn stable_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

impl SelectionStrategy for IpHash {
    fn pick(&self, candidates: &[Arc<BackendInstance>], ctx: &RequestContext) -> Option<Arc<BackendInstance>> {
        if candidates.is_empty() {
            return None;
        }
        match ctx.client_key.as_deref() {
            Some(key) => {
                let index = (stable_hash(key) % candidates.len() as u64) as usize;
                Some(candidates[index].clone())
            }
            None => self.fallback.next(candidates),
        }
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::IpHash
    }
}
