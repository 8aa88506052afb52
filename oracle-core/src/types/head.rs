use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::H256;

/// A block seen on the new-heads subscription.
///
/// Heads link into chains through `parent_hash`. When a head is handed out
/// by the head tracker, `parent` holds its ancestors in memory, up to the
/// lookback the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Head {
    /// Block hash
    pub hash: H256,
    /// Block number
    pub number: u64,
    /// Hash of the parent block
    pub parent_hash: H256,
    /// Block timestamp
    pub timestamp: DateTime<Utc>,
    /// The L1 block number reported by some L2 chains. Informational only.
    #[serde(default)]
    pub l1_block_number: Option<u64>,
    /// In-memory link to the parent head
    #[serde(skip)]
    pub parent: Option<Box<Head>>,
}

impl Head {
    /// A head with no parent link and no L1 block number
    pub fn new(hash: H256, number: u64, parent_hash: H256, timestamp: DateTime<Utc>) -> Self {
        Self {
            hash,
            number,
            parent_hash,
            timestamp,
            l1_block_number: None,
            parent: None,
        }
    }

    /// Returns this head with `parent` linked in.
    pub fn with_parent(mut self, parent: Head) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    /// Iterates over this head and its linked ancestors, newest first.
    pub fn chain(&self) -> impl Iterator<Item = &Head> {
        std::iter::successors(Some(self), |h| h.parent.as_deref())
    }

    /// Number of heads in the linked chain, including this one.
    pub fn chain_length(&self) -> u64 {
        self.chain().count() as u64
    }

    /// The oldest head reachable through parent links.
    pub fn earliest_in_chain(&self) -> &Head {
        let mut earliest = self;
        while let Some(parent) = earliest.parent.as_deref() {
            earliest = parent;
        }
        earliest
    }

    /// Hash of the linked ancestor at `number`, if the chain reaches it.
    pub fn hash_at_height(&self, number: u64) -> Option<H256> {
        self.chain().find(|h| h.number == number).map(|h| h.hash)
    }

    /// Whether `hash` belongs to the linked chain.
    pub fn is_in_chain(&self, hash: H256) -> bool {
        self.chain().any(|h| h.hash == hash)
    }

    /// Copy of this head with the parent chain cut after `lookback`
    /// ancestors.
    pub fn truncated(&self, lookback: u64) -> Head {
        let mut heads: Vec<Head> = self
            .chain()
            .take(lookback.saturating_add(1) as usize)
            .map(|h| Head {
                parent: None,
                ..h.clone()
            })
            .collect();
        let mut linked = match heads.pop() {
            Some(h) => h,
            None => return self.clone(),
        };
        while let Some(child) = heads.pop() {
            linked = child.with_parent(linked);
        }
        linked
    }
}

impl std::fmt::Display for Head {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Head(#{} {:?})", self.number, self.hash)
    }
}
