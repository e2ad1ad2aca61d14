// Opcode prefix lookup for one protocol version.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::template::{PacketTemplate, ProtocolVersion};

#[derive(Debug, Default)]
struct TrieNode {
    template: Option<Arc<PacketTemplate>>,
    children: HashMap<u8, TrieNode>,
}

impl TrieNode {
    fn insert(&mut self, template: Arc<PacketTemplate>) {
        let mut node = self;
        for &b in template.prefix() {
            node = node.children.entry(b).or_default();
        }
        node.template = Some(template);
    }
}

/// Maps the leading bytes of a packet to its template.
///
/// Built once from the definitions of a protocol version; the only mutation
/// afterwards is minting undefined templates for prefixes nothing covers.
#[derive(Debug)]
pub struct PrefixResolver {
    version: ProtocolVersion,
    root: TrieNode,
    templates: Vec<Arc<PacketTemplate>>,
    rejected: usize,
    discovered: RwLock<HashMap<Vec<u8>, Arc<PacketTemplate>>>,
}

impl PrefixResolver {
    /// Builds the lookup trie from the templates that apply to `version`.
    ///
    /// Templates are considered shortest prefix first. A prefix that extends an
    /// already accepted one is rejected, and when several templates share the
    /// exact same prefix none of them is kept.
    pub fn build<I>(version: ProtocolVersion, templates: I) -> Self
    where
        I: IntoIterator<Item = PacketTemplate>,
    {
        let mut candidates: Vec<PacketTemplate> = templates
            .into_iter()
            .filter(|t| {
                if t.prefix().is_empty() {
                    warn!(packet = %t.name(), "Ignoring template with empty prefix");
                    return false;
                }
                t.applies_to(version)
            })
            .collect();
        candidates.sort_by_key(|t| t.prefix().len());

        let mut accepted: Vec<Arc<PacketTemplate>> = Vec::new();
        let mut rejected = 0;
        let mut start = 0;
        while start < candidates.len() {
            let len = candidates[start].prefix().len();
            let end = candidates[start..]
                .iter()
                .position(|t| t.prefix().len() != len)
                .map_or(candidates.len(), |n| start + n);
            let group = &candidates[start..end];

            let mut occurrences: HashMap<&[u8], usize> = HashMap::new();
            for t in group {
                *occurrences.entry(t.prefix()).or_default() += 1;
            }

            let mut admitted = Vec::new();
            for t in group {
                if let Some(shorter) = accepted.iter().find(|a| t.prefix().starts_with(a.prefix())) {
                    warn!(
                        packet = %t,
                        shadowed_by = %shorter,
                        "Rejecting template: prefix already resolved by a shorter one"
                    );
                    rejected += 1;
                } else if occurrences[t.prefix()] > 1 {
                    warn!(packet = %t, "Rejecting template: prefix collides with another definition");
                    rejected += 1;
                } else {
                    admitted.push(Arc::new(t.clone()));
                }
            }
            accepted.extend(admitted);
            start = end;
        }

        let mut root = TrieNode::default();
        for t in &accepted {
            root.insert(Arc::clone(t));
        }
        debug!(
            version = %version,
            templates = accepted.len(),
            rejected,
            "Built prefix resolver"
        );

        Self {
            version,
            root,
            templates: accepted,
            rejected,
            discovered: RwLock::new(HashMap::new()),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Templates accepted at build time.
    pub fn templates(&self) -> &[Arc<PacketTemplate>] {
        &self.templates
    }

    pub fn rejected(&self) -> usize {
        self.rejected
    }

    pub fn discovered(&self) -> usize {
        self.discovered.read().len()
    }

    /// Template for the packet starting with `bytes`.
    ///
    /// Returns `None` when `bytes` ends before a prefix is decided. When the
    /// walk leaves every known prefix, an undefined template for exactly the
    /// bytes walked so far is returned; the same instance is handed out for
    /// every later packet with that prefix.
    pub fn resolve(&self, bytes: &[u8]) -> Option<Arc<PacketTemplate>> {
        let mut node = &self.root;
        for (i, b) in bytes.iter().enumerate() {
            match node.children.get(b) {
                Some(child) => {
                    if let Some(template) = &child.template {
                        return Some(Arc::clone(template));
                    }
                    node = child;
                }
                None => return Some(self.discover(&bytes[..=i])),
            }
        }
        None
    }

    fn discover(&self, prefix: &[u8]) -> Arc<PacketTemplate> {
        if let Some(template) = self.discovered.read().get(prefix) {
            return Arc::clone(template);
        }
        let mut discovered = self.discovered.write();
        Arc::clone(discovered.entry(prefix.to_vec()).or_insert_with(|| {
            debug!(prefix = %hex::encode_upper(prefix), "Registered undefined packet");
            Arc::new(PacketTemplate::undefined(prefix))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::VersionRange;
    use proptest::prelude::*;
    use std::sync::Barrier;
    use std::thread;

    fn templates() -> Vec<PacketTemplate> {
        vec![
            PacketTemplate::new(vec![0x00], "Die", Vec::new()),
            PacketTemplate::new(vec![0xfe, 0x02, 0x00], "ExEventMatchUserInfo", Vec::new()),
            PacketTemplate::new(vec![0xfe, 0x01], "ExRegenMax", Vec::new()),
        ]
    }

    #[test]
    fn test_extended_and_single_byte_coexist() {
        let resolver = PrefixResolver::build(ProtocolVersion(1), templates());
        assert_eq!(resolver.rejected(), 0);
        assert_eq!(resolver.resolve(&[0x00, 1, 2]).unwrap().name(), "Die");
        assert_eq!(
            resolver.resolve(&[0xfe, 0x02, 0x00, 9, 9]).unwrap().name(),
            "ExEventMatchUserInfo"
        );
        assert!(resolver.resolve(&[0xfe, 0x02]).is_none());
        assert!(resolver.resolve(&[]).is_none());
    }

    #[test]
    fn test_unknown_prefix_is_identity_stable() {
        let resolver = PrefixResolver::build(ProtocolVersion(1), templates());
        let first = resolver.resolve(&[0xfe, 0x03, 0x10]).unwrap();
        assert!(!first.is_defined());
        assert_eq!(first.prefix(), &[0xfe, 0x03]);
        let again = resolver.resolve(&[0xfe, 0x03, 0x77, 0x01]).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(resolver.discovered(), 1);

        let single = resolver.resolve(&[0x42]).unwrap();
        assert_eq!(single.name(), "Unknown_42");
    }

    #[test]
    fn test_concurrent_discovery_mints_one_template() {
        let resolver = Arc::new(PrefixResolver::build(ProtocolVersion(1), templates()));
        let barrier = Arc::new(Barrier::new(8));
        let found: Vec<Arc<PacketTemplate>> = (0..8u8)
            .map(|i| {
                let resolver = Arc::clone(&resolver);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    resolver.resolve(&[0xfe, 0x05, i]).unwrap()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| t.join().unwrap())
            .collect();
        for template in &found[1..] {
            assert!(Arc::ptr_eq(&found[0], template));
        }
        assert_eq!(found[0].prefix(), &[0xfe, 0x05]);
        assert_eq!(resolver.discovered(), 1);
    }

    #[test]
    fn test_equal_prefixes_rejected() {
        let mut defs = templates();
        defs.push(PacketTemplate::new(vec![0xfe, 0x01], "ExRegenMaxDup", Vec::new()));
        defs.push(PacketTemplate::new(vec![0xfe, 0x01], "ExRegenMaxDup2", Vec::new()));
        let resolver = PrefixResolver::build(ProtocolVersion(1), defs);
        assert_eq!(resolver.rejected(), 3);
        let t = resolver.resolve(&[0xfe, 0x01, 0x00]).unwrap();
        assert!(!t.is_defined());
    }

    #[test]
    fn test_shadowed_prefix_rejected() {
        let mut defs = templates();
        defs.push(PacketTemplate::new(vec![0x00, 0x05], "DieExtended", Vec::new()));
        let resolver = PrefixResolver::build(ProtocolVersion(1), defs);
        assert_eq!(resolver.rejected(), 1);
        assert_eq!(resolver.resolve(&[0x00, 0x05]).unwrap().name(), "Die");
    }

    #[test]
    fn test_build_is_order_independent() {
        let mut defs = templates();
        defs.push(PacketTemplate::new(vec![0x00], "Revive", Vec::new()));
        let forward = PrefixResolver::build(ProtocolVersion(1), defs.clone());
        defs.reverse();
        let backward = PrefixResolver::build(ProtocolVersion(1), defs);
        for resolver in [forward, backward] {
            assert!(!resolver.resolve(&[0x00]).unwrap().is_defined());
        }
    }

    #[test]
    fn test_version_filter() {
        let defs = vec![PacketTemplate::new(vec![0x10], "NewPacket", Vec::new()).with_versions(VersionRange {
            min: Some(ProtocolVersion(200)),
            max: None,
        })];
        let old = PrefixResolver::build(ProtocolVersion(100), defs.clone());
        assert!(!old.resolve(&[0x10]).unwrap().is_defined());
        let new = PrefixResolver::build(ProtocolVersion(200), defs);
        assert_eq!(new.resolve(&[0x10]).unwrap().name(), "NewPacket");
    }

    proptest! {
        #[test]
        fn prop_resolves_unique_template(
            singles in prop::collection::btree_set(0u8..0xf0, 1..32),
            extended in prop::collection::btree_set((any::<u8>(), any::<u8>()), 0..32),
            body in prop::collection::vec(any::<u8>(), 0..16),
        ) {
            let mut defs: Vec<PacketTemplate> = singles
                .iter()
                .map(|&b| PacketTemplate::new(vec![b], format!("S{:02X}", b), Vec::new()))
                .collect();
            defs.extend(
                extended
                    .iter()
                    .map(|&(a, b)| PacketTemplate::new(vec![0xfe, a, b], format!("E{:02X}{:02X}", a, b), Vec::new())),
            );
            let resolver = PrefixResolver::build(ProtocolVersion(1), defs.clone());
            prop_assert_eq!(resolver.rejected(), 0);
            for def in &defs {
                let mut packet = def.prefix().to_vec();
                packet.extend_from_slice(&body);
                let resolved = resolver.resolve(&packet);
                prop_assert!(resolved.is_some());
                let resolved = resolved.unwrap();
                prop_assert!(resolved.is_defined());
                prop_assert_eq!(resolved.name(), def.name());
            }
        }
    }
}
