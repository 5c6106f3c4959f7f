use std::fmt;

/// A node in an expansion or selection tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// `true` includes the field, `false` (from a leading `-`) excludes it
    Leaf(bool),
    /// Nested fields under this key
    Tree(ExpansionTree),
}

impl Node {
    /// Whether this node asks for the field at all.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Node::Leaf(false))
    }

    pub fn subtree(&self) -> Option<&ExpansionTree> {
        match self {
            Node::Tree(tree) => Some(tree),
            Node::Leaf(_) => None,
        }
    }
}

/// A recursive `key -> (true | false | subtree)` mapping parsed from a
/// comma-separated list of dotted paths.
///
/// Keys keep their insertion order, which drives expansion order. Writing a
/// path that already exists overwrites the previous value in place (last
/// write wins). `*` is an ordinary key with wildcard meaning to consumers,
/// and a leading `-` on a token marks its leaf as excluded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpansionTree {
    entries: Vec<(String, Node)>,
}

impl ExpansionTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a query-string value like `a,b.c,-d,*` into a tree.
    ///
    /// Empty tokens are skipped, so `"a,,b"` and trailing commas are
    /// harmless.
    pub fn parse(input: &str) -> Self {
        let mut tree = Self::new();
        for token in input.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let (path, enabled) = match token.strip_prefix('-') {
                Some(rest) => (rest, false),
                None => (token, true),
            };
            let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
            if segments.is_empty() {
                continue;
            }
            tree.set_path(&segments, enabled);
        }
        tree
    }

    /// Set the leaf at `path`, creating intermediate subtrees as needed.
    pub fn set_path(&mut self, path: &[&str], enabled: bool) {
        let (head, rest) = match path.split_first() {
            Some(split) => split,
            None => return,
        };

        if rest.is_empty() {
            match self.position(head) {
                Some(index) => self.entries[index].1 = Node::Leaf(enabled),
                None => self.entries.push(((*head).to_string(), Node::Leaf(enabled))),
            }
            return;
        }

        match self.position(head) {
            Some(index) => {
                if !matches!(self.entries[index].1, Node::Tree(_)) {
                    self.entries[index].1 = Node::Tree(ExpansionTree::new());
                }
                if let Node::Tree(subtree) = &mut self.entries[index].1 {
                    subtree.set_path(rest, enabled);
                }
            }
            None => {
                let mut subtree = ExpansionTree::new();
                subtree.set_path(rest, enabled);
                self.entries.push(((*head).to_string(), Node::Tree(subtree)));
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.position(key).map(|index| &self.entries[index].1)
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.entries.iter().map(|(key, node)| (key.as_str(), node))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether this level includes the `*` wildcard.
    pub fn has_wildcard(&self) -> bool {
        matches!(self.get("*"), Some(node) if node.is_enabled())
    }

    /// Whether `key` is explicitly excluded at this level.
    pub fn is_excluded(&self, key: &str) -> bool {
        matches!(self.get(key), Some(Node::Leaf(false)))
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }
}

impl fmt::Display for ExpansionTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, node) in self.iter() {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            match node {
                Node::Leaf(true) => write!(f, "{key}")?,
                Node::Leaf(false) => write!(f, "-{key}")?,
                Node::Tree(subtree) => write!(f, "{key}.({subtree})")?,
            }
        }
        Ok(())
    }
}
