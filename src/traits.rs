use crate::error::{ReconError, Result};
use crate::tree::Tree;
use log::warn;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

/// Discrete trait values keyed by leaf label, one or more state columns per
/// row, kept in file order until reconciled against a tree.
#[derive(Clone, Debug, PartialEq)]
pub struct TraitTable {
    rows: Vec<(String, Vec<String>)>,
}

impl TraitTable {
    /// Parses a whitespace-delimited `label state...` table. Blank lines and
    /// `#` comments are skipped.
    pub fn parse(content: &str) -> Result<TraitTable> {
        let mut rows: Vec<(String, Vec<String>)> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut width: Option<usize> = None;
        for (line_no, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let mut parts = trimmed.split_whitespace();
            let label = parts.next().unwrap_or_default().to_string();
            let states: Vec<String> = parts.map(|s| s.to_string()).collect();
            if states.is_empty() {
                return Err(ReconError::Topology(format!(
                    "Trait row {} for '{}' has no state",
                    line_no + 1,
                    label
                )));
            }
            match width {
                Some(w) if w != states.len() => {
                    return Err(ReconError::Topology(format!(
                        "Trait row {} for '{}' has {} states, expected {}",
                        line_no + 1,
                        label,
                        states.len(),
                        w
                    )));
                }
                None => width = Some(states.len()),
                _ => {}
            }
            if !seen.insert(label.clone()) {
                return Err(ReconError::Topology(format!(
                    "Duplicate trait row for '{}'",
                    label
                )));
            }
            rows.push((label, states));
        }
        Ok(TraitTable { rows })
    }

    pub fn from_path(path: &Path) -> Result<TraitTable> {
        let content = fs::read_to_string(path).map_err(|e| ReconError::io(path, e))?;
        TraitTable::parse(&content)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn labels(&self) -> Vec<&str> {
        self.rows.iter().map(|(l, _)| l.as_str()).collect()
    }

    pub fn states(&self, label: &str) -> Option<&[String]> {
        self.rows
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, s)| s.as_slice())
    }

    /// Reorders rows to the tree's leaf order. Every leaf needs a row; rows
    /// for labels absent from the tree are dropped.
    pub fn reconcile(&self, tree: &Tree) -> Result<TraitTable> {
        let index: HashMap<&str, &Vec<String>> =
            self.rows.iter().map(|(l, s)| (l.as_str(), s)).collect();
        let leaves = tree.leaf_labels();

        let missing: Vec<&str> = leaves
            .iter()
            .copied()
            .filter(|l| !index.contains_key(l))
            .collect();
        if !missing.is_empty() {
            return Err(ReconError::Topology(format!(
                "Tree leaves without trait rows: {}",
                missing.join(", ")
            )));
        }

        let leaf_set: HashSet<&str> = leaves.iter().copied().collect();
        let orphans: Vec<&str> = self
            .rows
            .iter()
            .map(|(l, _)| l.as_str())
            .filter(|l| !leaf_set.contains(l))
            .collect();
        if !orphans.is_empty() {
            warn!(
                "Ignoring {} trait rows with no matching leaf: {}",
                orphans.len(),
                orphans.join(", ")
            );
        }

        let rows = leaves
            .iter()
            .map(|l| (l.to_string(), index[l].clone()))
            .collect();
        Ok(TraitTable { rows })
    }

    /// Tab-separated data file for the reconstruction tool.
    pub fn to_data_file(&self) -> String {
        let mut out = String::new();
        for (label, states) in &self.rows {
            out.push_str(label);
            for s in states {
                out.push('\t');
                out.push_str(s);
            }
            out.push('\n');
        }
        out
    }
}
