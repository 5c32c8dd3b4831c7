#![allow(nonstandard_style)]

pub mod columns;
pub mod commands;
pub mod core;
pub mod diagnostics;
pub mod error;
pub mod traits;
pub mod tree;

pub use crate::commands::{
    command_lines, commands_for, node_tag_commands, render_commands, ControlFile, NodeTagCommand,
};
pub use crate::core::{load_chain_set, ChainLog, ChainSet, Control, ResultLog};
pub use crate::error::{ReconError, Result};
pub use crate::traits::TraitTable;
pub use crate::tree::{read_tree_file, Tree};

/// Arena node produced by the Newick parser. Children are indices into the
/// same arena; a node without children is a leaf.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Node {
    pub children: Vec<usize>,
    pub label: Option<String>,
}

fn is_delim(b: u8) -> bool {
    matches!(b, b'(' | b')' | b',' | b':' | b';' | b'[' | b']')
}

fn skip_ws(bytes: &[u8], idx: &mut usize) {
    while *idx < bytes.len() && bytes[*idx].is_ascii_whitespace() {
        *idx += 1;
    }
}

fn skip_annotations(bytes: &[u8], idx: &mut usize) {
    skip_ws(bytes, idx);
    while *idx < bytes.len() && bytes[*idx] == b'[' {
        *idx += 1;
        while *idx < bytes.len() && bytes[*idx] != b']' {
            *idx += 1;
        }
        if *idx < bytes.len() {
            *idx += 1;
        }
        skip_ws(bytes, idx);
    }
}

fn parse_label(bytes: &[u8], idx: &mut usize) -> Option<String> {
    skip_ws(bytes, idx);
    if *idx >= bytes.len() || is_delim(bytes[*idx]) {
        return None;
    }
    let start = *idx;
    while *idx < bytes.len() && !is_delim(bytes[*idx]) {
        *idx += 1;
    }
    let label = String::from_utf8_lossy(&bytes[start..*idx]).trim().to_string();
    if label.is_empty() {
        None
    } else {
        Some(label)
    }
}

fn skip_branch_length(bytes: &[u8], idx: &mut usize) {
    skip_ws(bytes, idx);
    if *idx < bytes.len() && bytes[*idx] == b':' {
        *idx += 1;
        while *idx < bytes.len() && !is_delim(bytes[*idx]) {
            *idx += 1;
        }
    }
}

fn finish_node(bytes: &[u8], idx: &mut usize, nodes: &mut Vec<Node>, node: Node) -> usize {
    skip_annotations(bytes, idx);
    skip_branch_length(bytes, idx);
    skip_annotations(bytes, idx);
    nodes.push(node);
    nodes.len() - 1
}

/// Parses one subtree with an explicit stack of open groups, so nesting
/// depth is bounded by memory rather than the call stack.
fn parse_subtree(bytes: &[u8], idx: &mut usize, nodes: &mut Vec<Node>) -> Result<usize> {
    let mut open: Vec<Vec<usize>> = Vec::new();
    loop {
        skip_ws(bytes, idx);
        if *idx >= bytes.len() {
            return Err(ReconError::Topology("Unexpected end of Newick".into()));
        }
        if bytes[*idx] == b'(' {
            *idx += 1;
            open.push(Vec::new());
            continue;
        }

        let label = parse_label(bytes, idx)
            .ok_or_else(|| ReconError::Topology("Expected leaf label in Newick".into()))?;
        let leaf = Node {
            children: Vec::new(),
            label: Some(label),
        };
        let mut current = finish_node(bytes, idx, nodes, leaf);

        loop {
            let Some(mut children) = open.pop() else {
                return Ok(current);
            };
            children.push(current);
            skip_ws(bytes, idx);
            if *idx >= bytes.len() {
                return Err(ReconError::Topology("Unterminated Newick group".into()));
            }
            match bytes[*idx] {
                b',' => {
                    *idx += 1;
                    open.push(children);
                    break;
                }
                b')' => {
                    *idx += 1;
                    // Internal labels (support values, node names) are kept
                    // but never used as leaf labels.
                    let label = parse_label(bytes, idx);
                    current = finish_node(bytes, idx, nodes, Node { children, label });
                }
                _ => {
                    return Err(ReconError::Topology(
                        "Invalid Newick group separator".into(),
                    ))
                }
            }
        }
    }
}

/// Parses a single Newick string into `(root, arena)`. Nodes are pushed in
/// postorder, so the root is always the last arena entry.
pub fn parse_newick(tree: &str) -> Result<(usize, Vec<Node>)> {
    let bytes = tree.as_bytes();
    let mut idx = 0usize;
    let mut nodes = Vec::new();
    let root = parse_subtree(bytes, &mut idx, &mut nodes)?;
    skip_ws(bytes, &mut idx);
    if idx < bytes.len() && bytes[idx] == b';' {
        idx += 1;
        skip_ws(bytes, &mut idx);
    }
    if idx < bytes.len() {
        return Err(ReconError::Topology(format!(
            "Unexpected characters after Newick tree at byte {}",
            idx
        )));
    }
    Ok((root, nodes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_newick_postorder_arena() {
        let (root, nodes) = parse_newick("((A,B),C);").unwrap();
        assert_eq!(root, nodes.len() - 1);
        assert_eq!(nodes.len(), 5);
        assert_eq!(nodes[0].label.as_deref(), Some("A"));
        assert_eq!(nodes[2].children, vec![0, 1]);
        assert_eq!(nodes[root].children.len(), 2);
    }

    #[test]
    fn parse_newick_skips_lengths_and_annotations() {
        let (root, nodes) =
            parse_newick("((A:0.1[&rate=1],B:0.2)0.95:0.3,C:1.0)[&R];").unwrap();
        let leaves: Vec<&str> = nodes
            .iter()
            .filter(|n| n.children.is_empty())
            .filter_map(|n| n.label.as_deref())
            .collect();
        assert_eq!(leaves, vec!["A", "B", "C"]);
        assert_eq!(nodes[2].label.as_deref(), Some("0.95"));
        assert_eq!(nodes[root].children.len(), 2);
    }

    #[test]
    fn parse_newick_rejects_malformed() {
        assert!(parse_newick("((A,B),C").is_err());
        assert!(parse_newick("(A,,B);").is_err());
        assert!(parse_newick("(A,B); (C,D);").is_err());
        assert!(parse_newick("(A,B)C)D;").is_err());
        assert!(parse_newick("").is_err());
    }

    #[test]
    fn parse_newick_handles_deep_caterpillar() {
        let depth = 20_000;
        let mut newick = "(".repeat(depth);
        newick.push_str("L0");
        for i in 1..=depth {
            newick.push_str(&format!(",L{})", i));
        }
        newick.push(';');
        let (root, nodes) = parse_newick(&newick).unwrap();
        assert_eq!(nodes.len(), 2 * depth + 1);
        assert_eq!(root, nodes.len() - 1);
        assert_eq!(nodes[root].children.len(), 2);
        assert_eq!(nodes[0].label.as_deref(), Some("L0"));
    }
}
