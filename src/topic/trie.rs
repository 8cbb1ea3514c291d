//! Topic trie
//!
//! Level-keyed prefix tree shared by the subscription index (values at
//! wildcard filters) and the retained-message store (values at concrete
//! topics). Nodes hold a literal-child map, a `+` child and a terminal `#`
//! slot. Removing the last value prunes empty nodes up to the nearest
//! still-used ancestor.

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

#[derive(Debug)]
struct TrieNode<V> {
    /// Value stored at a filter/topic terminating on this node
    value: Option<V>,
    children: AHashMap<CompactString, TrieNode<V>>,
    /// Child for the `+` single-level wildcard
    single_wildcard: Option<Box<TrieNode<V>>>,
    /// Value for a terminal `#` multi-level wildcard
    multi_wildcard: Option<V>,
}

impl<V> TrieNode<V> {
    fn new() -> Self {
        Self {
            value: None,
            children: AHashMap::new(),
            single_wildcard: None,
            multi_wildcard: None,
        }
    }

    fn is_unused(&self) -> bool {
        self.value.is_none()
            && self.multi_wildcard.is_none()
            && self.single_wildcard.is_none()
            && self.children.is_empty()
    }
}

#[derive(Debug)]
pub struct TopicTrie<V> {
    root: TrieNode<V>,
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::new(),
        }
    }

    /// True when no value is stored anywhere in the trie
    pub fn is_empty(&self) -> bool {
        self.root.is_unused()
    }

    /// Insert a value at `filter`, replacing and returning any previous one
    pub fn insert(&mut self, filter: &str, value: V) -> Option<V> {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            if level == "#" {
                return node.multi_wildcard.replace(value);
            }

            node = if level == "+" {
                node.single_wildcard.get_or_insert_with(|| Box::new(TrieNode::new()))
            } else {
                node.children.entry(CompactString::new(level)).or_insert_with(TrieNode::new)
            };

            if levels.peek().is_none() {
                return node.value.replace(value);
            }
        }

        None
    }

    /// Mutable access to the value stored at `filter`
    pub fn get_mut(&mut self, filter: &str) -> Option<&mut V> {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            if level == "#" {
                return node.multi_wildcard.as_mut();
            }

            node = if level == "+" {
                node.single_wildcard.as_mut()?.as_mut()
            } else {
                node.children.get_mut(level)?
            };

            if levels.peek().is_none() {
                return node.value.as_mut();
            }
        }

        None
    }

    /// Remove the value at `filter`, pruning nodes left empty
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        Self::remove_at(&mut self.root, &levels, 0).0
    }

    /// Returns (removed value, whether `node` is unused afterwards)
    fn remove_at(node: &mut TrieNode<V>, levels: &[&str], index: usize) -> (Option<V>, bool) {
        if index >= levels.len() {
            let value = node.value.take();
            return (value, node.is_unused());
        }

        let level = levels[index];
        let removed = match level {
            "#" => node.multi_wildcard.take(),
            "+" => match node.single_wildcard.as_mut() {
                Some(child) => {
                    let (value, empty) = Self::remove_at(child, levels, index + 1);
                    if empty {
                        node.single_wildcard = None;
                    }
                    value
                }
                None => None,
            },
            _ => match node.children.get_mut(level) {
                Some(child) => {
                    let (value, empty) = Self::remove_at(child, levels, index + 1);
                    if empty {
                        node.children.remove(level);
                    }
                    value
                }
                None => None,
            },
        };

        (removed, node.is_unused())
    }

    /// Visit every value whose filter matches the concrete `topic`.
    ///
    /// Traversal is depth-first pre-order: at each node the `#` slot, then
    /// the `+` branch, then the literal child. Within one call the order is
    /// stable; the caller holds the lock for the duration of a publish.
    /// Topics with a `$` first level match neither `#` nor `+` at the root.
    pub fn matches<F>(&self, topic: &str, mut visit: F)
    where
        F: FnMut(&V),
    {
        let reserved = topic.starts_with('$');
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::matches_at(&self.root, &levels, 0, reserved, &mut visit);
    }

    fn matches_at<F>(node: &TrieNode<V>, levels: &[&str], index: usize, reserved: bool, visit: &mut F)
    where
        F: FnMut(&V),
    {
        let wildcards_allowed = !(reserved && index == 0);

        if wildcards_allowed {
            if let Some(ref v) = node.multi_wildcard {
                visit(v);
            }
        }

        if index >= levels.len() {
            if let Some(ref v) = node.value {
                visit(v);
            }
            return;
        }

        if wildcards_allowed {
            if let Some(ref child) = node.single_wildcard {
                Self::matches_at(child, levels, index + 1, reserved, visit);
            }
        }

        if let Some(child) = node.children.get(levels[index]) {
            Self::matches_at(child, levels, index + 1, reserved, visit);
        }
    }

    /// Visit every value stored at a concrete topic matched by the wildcard
    /// `filter` (the retained-store direction of matching). The reserved
    /// rule applies symmetrically: `+` and `#` at the root skip `$`-topics.
    pub fn matches_filter<F>(&self, filter: &str, mut visit: F)
    where
        F: FnMut(&V),
    {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        Self::matches_filter_at(&self.root, &levels, 0, &mut visit);
    }

    fn matches_filter_at<F>(node: &TrieNode<V>, levels: &[&str], index: usize, visit: &mut F)
    where
        F: FnMut(&V),
    {
        if index >= levels.len() {
            if let Some(ref v) = node.value {
                visit(v);
            }
            return;
        }

        match levels[index] {
            "#" => {
                if let Some(ref v) = node.value {
                    visit(v);
                }
                Self::collect_subtree(node, index == 0, visit);
            }
            "+" => {
                for (key, child) in &node.children {
                    if index == 0 && key.starts_with('$') {
                        continue;
                    }
                    Self::matches_filter_at(child, levels, index + 1, visit);
                }
            }
            literal => {
                if let Some(child) = node.children.get(literal) {
                    Self::matches_filter_at(child, levels, index + 1, visit);
                }
            }
        }
    }

    fn collect_subtree<F>(node: &TrieNode<V>, skip_reserved: bool, visit: &mut F)
    where
        F: FnMut(&V),
    {
        for (key, child) in &node.children {
            if skip_reserved && key.starts_with('$') {
                continue;
            }
            if let Some(ref v) = child.value {
                visit(v);
            }
            Self::collect_subtree(child, false, visit);
        }
    }

    /// Visit every stored value, including ones behind wildcard levels
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&V),
    {
        Self::for_each_at(&self.root, &mut visit);
    }

    fn for_each_at<F>(node: &TrieNode<V>, visit: &mut F)
    where
        F: FnMut(&V),
    {
        if let Some(ref v) = node.value {
            visit(v);
        }
        if let Some(ref v) = node.multi_wildcard {
            visit(v);
        }
        if let Some(ref child) = node.single_wildcard {
            Self::for_each_at(child, visit);
        }
        for child in node.children.values() {
            Self::for_each_at(child, visit);
        }
    }
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(trie: &TopicTrie<i32>, topic: &str) -> Vec<i32> {
        let mut out = Vec::new();
        trie.matches(topic, |v| out.push(*v));
        out
    }

    #[test]
    fn exact_match() {
        let mut trie = TopicTrie::new();
        trie.insert("test/topic", 1);

        assert_eq!(collect(&trie, "test/topic"), vec![1]);
        assert!(collect(&trie, "test/other").is_empty());
    }

    #[test]
    fn single_level_wildcard() {
        let mut trie = TopicTrie::new();
        trie.insert("test/+", 1);
        trie.insert("+/topic", 2);
        trie.insert("+/+", 3);

        let mut matches = collect(&trie, "test/topic");
        matches.sort();
        assert_eq!(matches, vec![1, 2, 3]);
        assert!(collect(&trie, "test/topic/deep").is_empty());
    }

    #[test]
    fn multi_level_wildcard() {
        let mut trie = TopicTrie::new();
        trie.insert("#", 1);
        trie.insert("test/#", 2);

        let mut matches = collect(&trie, "test/topic/deep");
        matches.sort();
        assert_eq!(matches, vec![1, 2]);
        // "#" after "test" also matches the parent itself
        let mut matches = collect(&trie, "test");
        matches.sort();
        assert_eq!(matches, vec![1, 2]);
    }

    #[test]
    fn empty_levels_are_distinct() {
        let mut trie = TopicTrie::new();
        trie.insert("a//b", 1);
        assert_eq!(collect(&trie, "a//b"), vec![1]);
        assert!(collect(&trie, "a/b").is_empty());
        // + matches the empty level
        trie.insert("a/+/b", 2);
        let mut matches = collect(&trie, "a//b");
        matches.sort();
        assert_eq!(matches, vec![1, 2]);
    }

    #[test]
    fn reserved_topics_skip_root_wildcards() {
        let mut trie = TopicTrie::new();
        trie.insert("#", 1);
        trie.insert("+/foo", 2);
        trie.insert("$SYS/#", 3);

        assert_eq!(collect(&trie, "$SYS/foo"), vec![3]);
    }

    #[test]
    fn remove_prunes_empty_nodes() {
        let mut trie = TopicTrie::new();
        trie.insert("a/b/c", 1);
        trie.insert("a/b", 2);

        assert_eq!(trie.remove("a/b/c"), Some(1));
        assert!(!trie.is_empty());
        assert_eq!(trie.remove("a/b"), Some(2));
        assert!(trie.is_empty());

        // removing through wildcard paths prunes too
        trie.insert("x/+/y", 7);
        trie.insert("x/#", 8);
        assert_eq!(trie.remove("x/+/y"), Some(7));
        assert_eq!(trie.remove("x/#"), Some(8));
        assert!(trie.is_empty());
    }

    #[test]
    fn insert_replaces_existing_value() {
        let mut trie = TopicTrie::new();
        assert_eq!(trie.insert("a/+", 1), None);
        assert_eq!(trie.insert("a/+", 2), Some(1));
        assert_eq!(collect(&trie, "a/b"), vec![2]);
    }

    #[test]
    fn filter_match_over_concrete_topics() {
        let mut trie = TopicTrie::new();
        trie.insert("status/device7", 1);
        trie.insert("status/device9", 2);
        trie.insert("status/device7/battery", 3);
        trie.insert("$SYS/broker/uptime", 4);

        let mut out = Vec::new();
        trie.matches_filter("status/#", |v| out.push(*v));
        out.sort();
        assert_eq!(out, vec![1, 2, 3]);

        let mut out = Vec::new();
        trie.matches_filter("status/+", |v| out.push(*v));
        out.sort();
        assert_eq!(out, vec![1, 2]);

        // root wildcards never see $-topics
        let mut out = Vec::new();
        trie.matches_filter("#", |v| out.push(*v));
        out.sort();
        assert_eq!(out, vec![1, 2, 3]);

        let mut out = Vec::new();
        trie.matches_filter("$SYS/broker/uptime", |v| out.push(*v));
        assert_eq!(out, vec![4]);
    }
}
