use crate::error::{ReconError, Result};
use crate::{parse_newick, Node};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

/// Rooted tree over a node arena with conventional node numbering: leaves
/// are `1..=L` in order of appearance, internal nodes `L+1..` in preorder,
/// so the root is always `L+1`.
#[derive(Clone, Debug)]
pub struct Tree {
    nodes: Vec<Node>,
    root: usize,
    numbers: Vec<usize>,
    preorder: Vec<usize>,
    n_tips: usize,
}

fn check_leaf_labels(nodes: &[Node], preorder: &[usize]) -> Result<usize> {
    let mut labels: HashSet<&str> = HashSet::new();
    let mut n_tips = 0usize;
    for &idx in preorder {
        let node = &nodes[idx];
        if !node.children.is_empty() {
            continue;
        }
        n_tips += 1;
        let label = node
            .label
            .as_deref()
            .ok_or_else(|| ReconError::Topology(format!("Leaf node {} has no label", idx)))?;
        if label.chars().any(char::is_whitespace) {
            return Err(ReconError::Topology(format!(
                "Leaf label '{}' contains whitespace",
                label
            )));
        }
        if !labels.insert(label) {
            return Err(ReconError::Topology(format!(
                "Duplicate leaf label '{}'",
                label
            )));
        }
    }
    Ok(n_tips)
}

impl Tree {
    /// Builds a tree from an arena and validates it: every node must be
    /// reached exactly once from `root`, leaves must carry unique labels
    /// without whitespace.
    pub fn new(nodes: Vec<Node>, root: usize) -> Result<Tree> {
        if root >= nodes.len() {
            return Err(ReconError::Topology(format!(
                "Root index {} outside arena of {} nodes",
                root,
                nodes.len()
            )));
        }

        let mut seen = vec![false; nodes.len()];
        let mut preorder = Vec::with_capacity(nodes.len());
        let mut stack = vec![root];
        while let Some(idx) = stack.pop() {
            if seen[idx] {
                return Err(ReconError::Topology(format!(
                    "Node {} is reachable more than once; tree has a cycle or shared child",
                    idx
                )));
            }
            seen[idx] = true;
            preorder.push(idx);
            for &child in nodes[idx].children.iter().rev() {
                if child >= nodes.len() {
                    return Err(ReconError::Topology(format!(
                        "Node {} references missing child {}",
                        idx, child
                    )));
                }
                stack.push(child);
            }
        }
        if let Some(orphan) = seen.iter().position(|s| !s) {
            return Err(ReconError::Topology(format!(
                "Node {} is not reachable from the root",
                orphan
            )));
        }

        let n_tips = check_leaf_labels(&nodes, &preorder)?;

        let mut numbers = vec![0usize; nodes.len()];
        let mut next_tip = 1usize;
        let mut next_internal = n_tips + 1;
        for &idx in &preorder {
            if nodes[idx].children.is_empty() {
                numbers[idx] = next_tip;
                next_tip += 1;
            } else {
                numbers[idx] = next_internal;
                next_internal += 1;
            }
        }

        Ok(Tree {
            nodes,
            root,
            numbers,
            preorder,
            n_tips,
        })
    }

    pub fn from_newick(newick: &str) -> Result<Tree> {
        let (root, nodes) = parse_newick(newick)?;
        Tree::new(nodes, root)
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn n_tips(&self) -> usize {
        self.n_tips
    }

    pub fn n_internal(&self) -> usize {
        self.nodes.len() - self.n_tips
    }

    pub fn is_leaf(&self, idx: usize) -> bool {
        self.nodes[idx].children.is_empty()
    }

    pub fn children(&self, idx: usize) -> &[usize] {
        &self.nodes[idx].children
    }

    pub fn label(&self, idx: usize) -> Option<&str> {
        self.nodes[idx].label.as_deref()
    }

    /// Conventional node number of arena entry `idx`.
    pub fn node_id(&self, idx: usize) -> usize {
        self.numbers[idx]
    }

    /// Leaf labels ordered by leaf number.
    pub fn leaf_labels(&self) -> Vec<&str> {
        self.preorder
            .iter()
            .filter(|&&idx| self.is_leaf(idx))
            .filter_map(|&idx| self.label(idx))
            .collect()
    }

    /// Arena indices of internal nodes ordered by node number, root first.
    pub fn internal_nodes(&self) -> Vec<usize> {
        self.preorder
            .iter()
            .copied()
            .filter(|&idx| !self.is_leaf(idx))
            .collect()
    }

    /// Leaf labels below `idx` in preorder. A leaf's set is itself.
    pub fn descendant_leaves(&self, idx: usize) -> Vec<&str> {
        let mut out = Vec::new();
        let mut stack = vec![idx];
        while let Some(current) = stack.pop() {
            let node = &self.nodes[current];
            if node.children.is_empty() {
                if let Some(label) = node.label.as_deref() {
                    out.push(label);
                }
                continue;
            }
            stack.extend(node.children.iter().rev());
        }
        out
    }
}

fn strip_nexus_prefix(s: &str) -> &str {
    let trimmed = s.trim();
    if let Some(idx) = trimmed.find('=') {
        return trimmed[idx + 1..].trim();
    }
    trimmed
}

fn strip_bracket_blocks(s: &str) -> String {
    let mut out = String::new();
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        if ch == '[' {
            for c in chars.by_ref() {
                if c == ']' {
                    break;
                }
            }
            continue;
        }
        out.push(ch);
    }
    out
}

fn parse_translate(block: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for entry in block.split(',') {
        let mut parts = entry.split_whitespace();
        if let (Some(key), Some(value)) = (parts.next(), parts.next()) {
            map.insert(
                key.to_string(),
                value.trim_matches(|c| c == '\'' || c == '"').to_string(),
            );
        }
    }
    map
}

fn parse_nexus_tree(content: &str) -> Result<Tree> {
    let mut translate: Option<HashMap<String, String>> = None;
    let mut translate_buf: Option<String> = None;
    for line in content.lines() {
        let trimmed = line.trim();
        let lower = trimmed.to_lowercase();
        if let Some(buf) = translate_buf.as_mut() {
            buf.push(' ');
            buf.push_str(trimmed);
            if trimmed.ends_with(';') {
                let block = buf.trim_end_matches(';').to_string();
                translate = Some(parse_translate(&block));
                translate_buf = None;
            }
            continue;
        }
        if lower == "translate" || lower.starts_with("translate ") || lower.starts_with("translate\t") {
            let rest = trimmed.get("translate".len()..).unwrap_or("").trim();
            if rest.ends_with(';') {
                translate = Some(parse_translate(rest.trim_end_matches(';')));
            } else {
                translate_buf = Some(rest.to_string());
            }
            continue;
        }
        if lower.starts_with("tree ") || lower.starts_with("utree ") {
            let stripped = strip_bracket_blocks(strip_nexus_prefix(trimmed));
            let (root, mut nodes) = parse_newick(stripped.trim())?;
            if let Some(map) = &translate {
                debug!("Applying NEXUS translate table with {} entries", map.len());
                for node in nodes.iter_mut().filter(|n| n.children.is_empty()) {
                    if let Some(label) = node.label.as_ref().and_then(|l| map.get(l)) {
                        node.label = Some(label.clone());
                    }
                }
            }
            return Tree::new(nodes, root);
        }
    }
    Err(ReconError::Topology("No trees found in nexus file".into()))
}

/// Reads the first tree of a Newick or NEXUS file.
pub fn read_tree_file(path: &Path) -> Result<Tree> {
    let content = fs::read_to_string(path).map_err(|e| ReconError::io(path, e))?;
    if content.trim_start().to_lowercase().starts_with("#nexus") {
        return parse_nexus_tree(&content);
    }
    let mut newick = String::new();
    for line in content.lines() {
        let cand = line.trim();
        if cand.is_empty() {
            continue;
        }
        newick.push_str(cand);
        if cand.ends_with(';') {
            break;
        }
    }
    if newick.is_empty() {
        return Err(ReconError::Topology("No trees found in newick file".into()));
    }
    Tree::from_newick(&strip_bracket_blocks(&newick))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn all_labels(tree: &Tree) -> HashSet<&str> {
        tree.leaf_labels().into_iter().collect()
    }

    #[test]
    fn numbering_follows_preorder() {
        let tree = Tree::from_newick("((A,B),(C,D));").unwrap();
        assert_eq!(tree.n_tips(), 4);
        assert_eq!(tree.n_internal(), 3);
        assert_eq!(tree.node_id(tree.root()), 5);
        let ids: Vec<usize> = tree.internal_nodes().iter().map(|&i| tree.node_id(i)).collect();
        assert_eq!(ids, vec![5, 6, 7]);
        assert_eq!(tree.leaf_labels(), vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn root_covers_every_leaf() {
        let tree = Tree::from_newick("(((A,B),C),(D,(E,F,G)));").unwrap();
        let root_set = tree.descendant_leaves(tree.root());
        assert_eq!(root_set.len(), tree.n_tips());
        assert_eq!(root_set.into_iter().collect::<HashSet<_>>(), all_labels(&tree));
    }

    #[test]
    fn children_partition_parent_leaf_set() {
        let tree = Tree::from_newick("(((A,B),C),(D,(E,F,G)),H);").unwrap();
        let universe = all_labels(&tree);
        for idx in tree.internal_nodes() {
            let parent = tree.descendant_leaves(idx);
            assert!(!parent.is_empty());
            assert!(parent.iter().all(|l| universe.contains(l)));

            let mut from_children = Vec::new();
            for &child in tree.children(idx) {
                from_children.extend(tree.descendant_leaves(child));
            }
            let unique: HashSet<&str> = from_children.iter().copied().collect();
            assert_eq!(unique.len(), from_children.len());
            assert_eq!(from_children, parent);
        }
    }

    #[test]
    fn rejects_duplicate_and_whitespace_labels() {
        let err = Tree::from_newick("((A,B),A);").unwrap_err();
        assert!(err.to_string().contains("Duplicate leaf label"));
        let err = Tree::from_newick("((A B,C),D);").unwrap_err();
        assert!(err.to_string().contains("whitespace"));
    }

    #[test]
    fn rejects_cycles_and_unreachable_nodes() {
        let looped = vec![
            Node {
                children: vec![1],
                label: None,
            },
            Node {
                children: vec![0],
                label: None,
            },
        ];
        assert!(matches!(Tree::new(looped, 0), Err(ReconError::Topology(_))));

        let detached = vec![
            Node {
                children: Vec::new(),
                label: Some("A".into()),
            },
            Node {
                children: Vec::new(),
                label: Some("B".into()),
            },
        ];
        let err = Tree::new(detached, 0).unwrap_err();
        assert!(err.to_string().contains("not reachable"));
    }

    #[test]
    fn single_leaf_tree_has_no_internal_nodes() {
        let tree = Tree::from_newick("A;").unwrap();
        assert_eq!(tree.n_tips(), 1);
        assert!(tree.internal_nodes().is_empty());
    }

    #[test]
    fn reads_nexus_with_translate() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "#NEXUS\nbegin trees;\n  translate\n    1 Homo,\n    2 Pan,\n    3 Gorilla\n  ;\n  tree t1 = [&R] ((1:0.1,2:0.1):0.2,3:0.3);\nend;"
        )
        .unwrap();
        let tree = read_tree_file(file.path()).unwrap();
        assert_eq!(tree.leaf_labels(), vec!["Homo", "Pan", "Gorilla"]);
    }

    #[test]
    fn reads_nexus_with_single_line_translate() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "#NEXUS\nBEGIN TREES;\n  Translate 1 Homo, 2 Pan, 3 Gorilla;\n  tree t1 = ((1,2),3);\nEND;"
        )
        .unwrap();
        let tree = read_tree_file(file.path()).unwrap();
        assert_eq!(tree.leaf_labels(), vec!["Homo", "Pan", "Gorilla"]);
    }

    #[test]
    fn reads_nexus_translate_starting_on_keyword_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "#NEXUS\nbegin trees;\n  translate 1 Homo,\n    2 Pan,\n    3 Gorilla;\n  tree t1 = ((1,2),3);\nend;"
        )
        .unwrap();
        let tree = read_tree_file(file.path()).unwrap();
        assert_eq!(tree.leaf_labels(), vec!["Homo", "Pan", "Gorilla"]);
    }

    #[test]
    fn deep_caterpillar_tree_is_numbered() {
        let depth = 5_000;
        let mut newick = "(".repeat(depth);
        newick.push_str("L0");
        for i in 1..=depth {
            newick.push_str(&format!(",L{})", i));
        }
        newick.push(';');
        let tree = Tree::from_newick(&newick).unwrap();
        assert_eq!(tree.n_tips(), depth + 1);
        assert_eq!(tree.node_id(tree.root()), depth + 2);
        assert_eq!(tree.descendant_leaves(tree.root()).len(), depth + 1);
    }

    #[test]
    fn reads_multiline_newick() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "((A,B),\n(C,D));\n((A,C),(B,D));").unwrap();
        let tree = read_tree_file(file.path()).unwrap();
        assert_eq!(tree.n_internal(), 3);
    }
}
