use crate::core::{ChainSet, Table};
use crate::error::{ReconError, Result};
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

/// Naming scheme of per-node per-state probability columns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnKeyStyle {
    /// `<node>.p.<state>`, as emitted for maximum-likelihood runs.
    Dotted,
    /// `x<node>_p_<state>`, as emitted for MCMC runs.
    Prefixed,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StateKey {
    pub node: String,
    pub state: String,
}

fn dotted_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([^.\s]+)\.[pP]\.([^.\s]+)$").expect("valid regex"))
}

fn prefixed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^x([^_\s]+)_[pP]_([^_\s]+)$").expect("valid regex"))
}

impl ColumnKeyStyle {
    /// Picks the style a header claims by its delimiter or prefix, without
    /// checking the full grammar.
    pub fn detect(header: &str) -> Option<ColumnKeyStyle> {
        if header.contains(".p.") || header.contains(".P.") {
            Some(ColumnKeyStyle::Dotted)
        } else if header.starts_with('x') && (header.contains("_p_") || header.contains("_P_")) {
            Some(ColumnKeyStyle::Prefixed)
        } else {
            None
        }
    }

    pub fn parse(self, header: &str) -> Result<StateKey> {
        let re = match self {
            ColumnKeyStyle::Dotted => dotted_re(),
            ColumnKeyStyle::Prefixed => prefixed_re(),
        };
        let caps = re.captures(header).ok_or_else(|| {
            ReconError::Format(format!(
                "Column '{}' does not match the {:?} node/state grammar",
                header, self
            ))
        })?;
        Ok(StateKey {
            node: caps[1].to_string(),
            state: caps[2].to_string(),
        })
    }
}

/// Column indices holding state probabilities with their parsed keys. All
/// such columns of one table must share a single style.
pub fn state_columns(table: &Table) -> Result<Vec<(usize, StateKey)>> {
    let mut style: Option<ColumnKeyStyle> = None;
    let mut out = Vec::new();
    for (idx, header) in table.headers.iter().enumerate() {
        let Some(detected) = ColumnKeyStyle::detect(header) else {
            continue;
        };
        match style {
            None => style = Some(detected),
            Some(s) if s != detected => {
                return Err(ReconError::Format(format!(
                    "Column '{}' uses {:?} keys but earlier columns use {:?}",
                    header, detected, s
                )));
            }
            _ => {}
        }
        out.push((idx, detected.parse(header)?));
    }
    Ok(out)
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StateProbability {
    pub chain_id: usize,
    pub iteration: u64,
    pub node: String,
    pub state: String,
    pub probability: f64,
}

/// Wide-to-long reshape of every state-probability cell in the set. NA
/// cells are dropped.
pub fn reshape_long(set: &ChainSet) -> Result<Vec<StateProbability>> {
    let mut rows = Vec::new();
    for chain in set.chains() {
        let keys = state_columns(&chain.params)?;
        for (row, iteration) in chain.iterations.iter().enumerate() {
            for (col, key) in &keys {
                let probability = chain.params.columns[*col][row];
                if !probability.is_finite() {
                    continue;
                }
                rows.push(StateProbability {
                    chain_id: chain.chain_id,
                    iteration: *iteration,
                    node: key.node.clone(),
                    state: key.state.clone(),
                    probability,
                });
            }
        }
    }
    Ok(rows)
}
