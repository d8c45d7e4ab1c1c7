use std::collections::HashMap;

#[derive(Debug, Default)]
struct Node {
    value: Option<String>,
    children: HashMap<String, Node>,
}

/// Reversed-label trie mapping domain suffixes to upstream addresses.
///
/// Labels are consumed right to left, so `insert(&["google", "com"], ..)`
/// stores the value two levels below the root under `com` then `google`.
/// Built once at startup and only read afterwards.
#[derive(Debug, Default)]
pub struct SuffixTree {
    root: Node,
}

impl SuffixTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    /// Store `value` at the node reached by walking `labels` right to left.
    pub fn insert(&mut self, labels: &[&str], value: &str) {
        if labels.is_empty() {
            return;
        }
        let mut node = &mut self.root;
        for label in labels.iter().rev() {
            node = node.children.entry((*label).to_string()).or_default();
        }
        // an empty value clears the binding rather than shadowing ancestors
        node.value = (!value.is_empty()).then(|| value.to_string());
    }

    /// Return the value of the deepest matched suffix, most specific wins.
    /// Interior nodes without a value are transparent; the walk keeps the
    /// last binding seen on the way down.
    pub fn search(&self, labels: &[&str]) -> Option<&str> {
        let mut node = &self.root;
        let mut found = None;
        for label in labels.iter().rev() {
            match node.children.get(*label) {
                Some(child) => {
                    if let Some(value) = &child.value {
                        found = Some(value.as_str());
                    }
                    node = child;
                }
                None => break,
            }
        }
        found
    }

    /// Convenience wrapper splitting a dotted name into labels.
    pub fn insert_name(&mut self, name: &str, value: &str) {
        let labels: Vec<&str> = name.split('.').filter(|l| !l.is_empty()).collect();
        self.insert(&labels, value);
    }

    pub fn search_name(&self, name: &str) -> Option<&str> {
        let labels: Vec<&str> = name.split('.').filter(|l| !l.is_empty()).collect();
        self.search(&labels)
    }
}
