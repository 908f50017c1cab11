//! Versioned registry of code blocks declared by the model.
//!
//! A block is identified by `(name, version)`. Among blocks sharing a name
//! the highest version is authoritative. Blocks are superseded by higher
//! versions, never mutated in place; a name disappears from the registry
//! only through eviction after a failed execution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A named, versioned unit of declared content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    pub name: String,
    pub version: u32,
    pub lang: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Result of declaring a block into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclareOutcome {
    /// New `(name, version)` pair, stored.
    Inserted,
    /// Same `(name, version)` with identical content: a no-op.
    Identical,
    /// Same `(name, version)` with differing content: rejected, not merged.
    Conflict,
}

/// In-memory store of declared blocks, keyed by name and version.
#[derive(Debug, Clone, Default)]
pub struct BlockRegistry {
    blocks: BTreeMap<String, BTreeMap<u32, CodeBlock>>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a declaration. Re-declaring an existing `(name, version)` with
    /// identical content is accepted as a no-op; differing content is a
    /// conflict and the stored block is left untouched.
    pub fn declare(&mut self, block: CodeBlock) -> DeclareOutcome {
        let versions = self.blocks.entry(block.name.clone()).or_default();
        match versions.get(&block.version) {
            Some(existing) if *existing == block => DeclareOutcome::Identical,
            Some(_) => DeclareOutcome::Conflict,
            None => {
                versions.insert(block.version, block);
                DeclareOutcome::Inserted
            }
        }
    }

    /// Version to assign to a declaration that did not specify one:
    /// one past the current maximum for the name, or 1.
    pub fn next_version(&self, name: &str) -> u32 {
        self.blocks
            .get(name)
            .and_then(|versions| versions.keys().next_back())
            .map_or(1, |max| max + 1)
    }

    /// The authoritative (highest-version) block for a name.
    pub fn latest(&self, name: &str) -> Option<&CodeBlock> {
        self.blocks
            .get(name)
            .and_then(|versions| versions.values().next_back())
    }

    pub fn get(&self, name: &str, version: u32) -> Option<&CodeBlock> {
        self.blocks.get(name).and_then(|versions| versions.get(&version))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.blocks.contains_key(name)
    }

    /// Remove every version of a name. Returns whether anything was removed.
    pub fn evict(&mut self, name: &str) -> bool {
        self.blocks.remove(name).is_some()
    }

    /// All blocks ordered by name then version, for transcript snapshots.
    pub fn to_list(&self) -> Vec<CodeBlock> {
        self.blocks
            .values()
            .flat_map(|versions| versions.values().cloned())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
