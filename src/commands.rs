use crate::error::{ReconError, Result};
use crate::traits::TraitTable;
use crate::tree::Tree;
use log::info;

/// Tag definition plus reconstruction request for one internal node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeTagCommand {
    pub node_id: usize,
    pub tag_name: String,
    pub member_labels: Vec<String>,
}

impl NodeTagCommand {
    pub fn tag_command(&self) -> String {
        format!("AddTag {} {}", self.tag_name, self.member_labels.join(" "))
    }

    pub fn reconstruct_command(&self) -> String {
        format!("AddNode {} {}", self.node_id, self.tag_name)
    }
}

pub fn node_tag_commands(tree: &Tree) -> Vec<NodeTagCommand> {
    tree.internal_nodes()
        .into_iter()
        .map(|idx| {
            let node_id = tree.node_id(idx);
            NodeTagCommand {
                node_id,
                tag_name: format!("T{}", node_id),
                member_labels: tree
                    .descendant_leaves(idx)
                    .into_iter()
                    .map(|l| l.to_string())
                    .collect(),
            }
        })
        .collect()
}

/// Command lines in emission order: each `AddTag` directly followed by the
/// `AddNode` that references it.
pub fn command_lines(tree: &Tree) -> Vec<String> {
    render_commands(&node_tag_commands(tree))
}

/// Tag line followed by its reconstruction line, for every command.
pub fn render_commands(tags: &[NodeTagCommand]) -> Vec<String> {
    tags.iter()
        .flat_map(|c| [c.tag_command(), c.reconstruct_command()])
        .collect()
}

/// Generates commands only after the trait table has been reconciled with
/// the tree, so a mismatched dataset never produces output.
pub fn commands_for(tree: &Tree, traits: &TraitTable) -> Result<Vec<NodeTagCommand>> {
    let reconciled = traits.reconcile(tree)?;
    info!(
        "Tagging {} internal nodes over {} leaves",
        tree.n_internal(),
        reconciled.len()
    );
    Ok(node_tag_commands(tree))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Analysis {
    MaximumLikelihood,
    Mcmc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct McmcSettings {
    pub iterations: u64,
    pub burnin: u64,
    pub sample_period: u64,
}

impl Default for McmcSettings {
    fn default() -> Self {
        Self {
            iterations: 1_010_000,
            burnin: 10_000,
            sample_period: 1_000,
        }
    }
}

/// Complete command file for a MultiState run: model and analysis lines,
/// run settings, node tags, and the terminal `Run`.
#[derive(Clone, Debug)]
pub struct ControlFile {
    pub analysis: Analysis,
    pub mcmc: Option<McmcSettings>,
    pub log_file: Option<String>,
    pub tags: Vec<NodeTagCommand>,
}

impl ControlFile {
    pub fn new(analysis: Analysis, tags: Vec<NodeTagCommand>) -> Self {
        let mcmc = match analysis {
            Analysis::Mcmc => Some(McmcSettings::default()),
            Analysis::MaximumLikelihood => None,
        };
        Self {
            analysis,
            mcmc,
            log_file: None,
            tags,
        }
    }

    pub fn render(&self) -> Result<String> {
        let mut lines: Vec<String> = vec!["1".to_string()];
        match self.analysis {
            Analysis::MaximumLikelihood => {
                if self.mcmc.is_some() {
                    return Err(ReconError::Control(
                        "MCMC settings given for a maximum-likelihood run".into(),
                    ));
                }
                lines.push("1".to_string());
            }
            Analysis::Mcmc => {
                lines.push("2".to_string());
                if let Some(m) = &self.mcmc {
                    if m.sample_period == 0 {
                        return Err(ReconError::Control("Sample period must be positive".into()));
                    }
                    if m.burnin >= m.iterations {
                        return Err(ReconError::Control(format!(
                            "Burn-in {} must be below iterations {}",
                            m.burnin, m.iterations
                        )));
                    }
                    lines.push(format!("Iterations {}", m.iterations));
                    lines.push(format!("Burnin {}", m.burnin));
                    lines.push(format!("Sample {}", m.sample_period));
                }
            }
        }
        if let Some(name) = &self.log_file {
            lines.push(format!("LogFile {}", name));
        }
        lines.extend(render_commands(&self.tags));
        lines.push("Run".to_string());
        let mut out = lines.join("\n");
        out.push('\n');
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn four_leaf_tree_commands() {
        let tree = Tree::from_newick("((A,B),(C,D));").unwrap();
        let lines = command_lines(&tree);
        assert_eq!(
            lines,
            vec![
                "AddTag T5 A B C D",
                "AddNode 5 T5",
                "AddTag T6 A B",
                "AddNode 6 T6",
                "AddTag T7 C D",
                "AddNode 7 T7",
            ]
        );
    }

    #[test]
    fn node_command_follows_its_tag() {
        let tree = Tree::from_newick("(((A,B),C),(D,(E,F,G)),H);").unwrap();
        let lines = command_lines(&tree);
        assert_eq!(lines.len(), 2 * tree.n_internal());
        for pair in lines.chunks(2) {
            let tag = pair[0].split_whitespace().nth(1).unwrap();
            let id = tag.trim_start_matches('T');
            assert!(pair[0].starts_with("AddTag "));
            assert_eq!(pair[1], format!("AddNode {} {}", id, tag));
        }
    }

    #[test]
    fn generation_is_idempotent() {
        let tree = Tree::from_newick("((A,(B,C)),(D,E));").unwrap();
        assert_eq!(command_lines(&tree), command_lines(&tree));
    }

    #[test]
    fn single_leaf_yields_nothing() {
        let tree = Tree::from_newick("A;").unwrap();
        assert!(command_lines(&tree).is_empty());
    }

    #[test]
    fn root_tag_spans_all_leaves() {
        let tree = Tree::from_newick("((A,B),C);").unwrap();
        let cmds = node_tag_commands(&tree);
        assert_eq!(cmds[0].node_id, 4);
        assert_eq!(cmds[0].member_labels, vec!["A", "B", "C"]);
    }

    #[test]
    fn commands_for_rejects_trait_mismatch() {
        let tree = Tree::from_newick("((A,B),C);").unwrap();
        let traits = TraitTable::parse("A 0\nB 1\n").unwrap();
        assert!(commands_for(&tree, &traits).is_err());
        let traits = TraitTable::parse("C 1\nA 0\nB 1\n").unwrap();
        let tags = commands_for(&tree, &traits).unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(render_commands(&tags), command_lines(&tree));
    }

    #[test]
    fn control_file_ends_with_run() {
        let tree = Tree::from_newick("((A,B),C);").unwrap();
        let mut control = ControlFile::new(Analysis::Mcmc, node_tag_commands(&tree));
        control.log_file = Some("chain1".to_string());
        let rendered = control.render().unwrap();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(
            lines,
            vec![
                "1",
                "2",
                "Iterations 1010000",
                "Burnin 10000",
                "Sample 1000",
                "LogFile chain1",
                "AddTag T4 A B C",
                "AddNode 4 T4",
                "AddTag T5 A B",
                "AddNode 5 T5",
                "Run",
            ]
        );
    }

    #[test]
    fn control_file_rejects_bad_settings() {
        let mut control = ControlFile::new(Analysis::Mcmc, Vec::new());
        control.mcmc = Some(McmcSettings {
            iterations: 100,
            burnin: 100,
            sample_period: 10,
        });
        assert!(control.render().is_err());
    }
}
