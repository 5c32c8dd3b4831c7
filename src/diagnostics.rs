use crate::columns::{StateKey, StateProbability};
use crate::core::{available_threads, init_threads, ChainSet, Control};
use crate::error::{ReconError, Result};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;

/// Tracer-style effective sample size (Geyer initial positive sequence).
pub fn ess_tracer(input: &[f64]) -> f64 {
    let samples = input.len();
    if samples < 2 {
        return samples as f64;
    }
    let max_lag_limit = 2000usize;
    let max_lag = std::cmp::min(samples - 1, max_lag_limit);
    let mean = input.iter().sum::<f64>() / samples as f64;
    let mut gamma_stat = vec![0.0; max_lag];
    let mut var_stat = 0.0;
    for lag in 0..max_lag {
        let mut acc = 0.0;
        for j in 0..(samples - lag) {
            acc += (input[j] - mean) * (input[j + lag] - mean);
        }
        gamma_stat[lag] = acc / (samples - lag) as f64;
        if lag == 0 {
            var_stat = gamma_stat[0];
        } else if lag % 2 == 0 {
            let pair_sum = gamma_stat[lag - 1] + gamma_stat[lag];
            if pair_sum > 0.0 {
                var_stat += 2.0 * pair_sum;
            } else {
                break;
            }
        }
    }
    let act = var_stat / gamma_stat[0];
    samples as f64 / act
}

pub fn min_ess(precision: f64) -> f64 {
    (1.0 / (precision * 4.0)).powi(2)
}

fn mean(x: &[f64]) -> f64 {
    x.iter().sum::<f64>() / x.len() as f64
}

fn sample_var(x: &[f64], m: f64) -> f64 {
    x.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (x.len() as f64 - 1.0)
}

/// Gelman-Rubin potential scale reduction factor over equal-length chains,
/// without discarding any leading samples. `None` when fewer than two
/// chains, fewer than two samples, or zero within-chain variance.
pub fn gelman_rubin(chains: &[&[f64]]) -> Option<f64> {
    let m = chains.len();
    if m < 2 {
        return None;
    }
    let n = chains.iter().map(|c| c.len()).min()?;
    if n < 2 || chains.iter().any(|c| c.len() != n) {
        return None;
    }
    let means: Vec<f64> = chains.iter().map(|c| mean(c)).collect();
    let grand = mean(&means);
    let w = chains
        .iter()
        .zip(means.iter())
        .map(|(c, mu)| sample_var(c, *mu))
        .sum::<f64>()
        / m as f64;
    if w <= 0.0 {
        return None;
    }
    let b_over_n = means.iter().map(|mu| (mu - grand).powi(2)).sum::<f64>() / (m as f64 - 1.0);
    let nf = n as f64;
    let v_hat = (nf - 1.0) / nf * w + (1.0 + 1.0 / m as f64) * b_over_n;
    Some((v_hat / w).sqrt())
}

/// Type-7 sample quantile of already sorted values.
pub fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let n = sorted.len() as f64;
    let h = (n - 1.0) * p + 1.0;
    let j = h.floor();
    let g = h - j;
    let j_idx = (j as usize).saturating_sub(1);
    let j1_idx = (j_idx + 1).min(sorted.len() - 1);
    if j1_idx == j_idx {
        sorted[j_idx]
    } else {
        sorted[j_idx] + g * (sorted[j1_idx] - sorted[j_idx])
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ParameterDiagnostics {
    pub name: String,
    pub ess_per_chain: Vec<f64>,
    /// Sum of per-chain ESS.
    pub ess: f64,
    pub psrf: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Diagnostics {
    pub n_chains: usize,
    pub total_samples: usize,
    pub start: u64,
    pub end: u64,
    pub thin: u64,
    /// Burn-in reported by the first chain's log, if any.
    pub burn_in: Option<u64>,
    pub parameters: Vec<ParameterDiagnostics>,
    /// Constant parameters and parameters with missing values.
    pub excluded: Vec<String>,
}

impl Diagnostics {
    /// Parameters whose ESS is below the minimum for `control.precision` or
    /// whose PSRF exceeds `control.psrf_threshold`.
    pub fn failures(&self, control: &Control) -> Vec<String> {
        let minimum = min_ess(control.precision);
        let mut out = Vec::new();
        for p in &self.parameters {
            if p.ess < minimum {
                out.push(format!("{}: ESS {:.1} below {:.0}", p.name, p.ess, minimum));
            }
            if let Some(r) = p.psrf {
                if r > control.psrf_threshold {
                    out.push(format!(
                        "{}: PSRF {:.3} above {}",
                        p.name, r, control.psrf_threshold
                    ));
                }
            }
        }
        out
    }

    pub fn converged(&self, control: &Control) -> bool {
        self.failures(control).is_empty()
    }
}

enum Outcome {
    Diagnosed(ParameterDiagnostics),
    Excluded(String),
}

fn diagnose_parameter(name: &str, chains: &[&[f64]]) -> Outcome {
    if chains.iter().any(|c| c.iter().any(|v| !v.is_finite())) {
        return Outcome::Excluded(name.to_string());
    }
    let first = chains.first().and_then(|c| c.first()).copied();
    let constant = chains
        .iter()
        .all(|c| c.iter().all(|v| Some(*v) == first));
    if constant {
        return Outcome::Excluded(name.to_string());
    }
    let ess_per_chain: Vec<f64> = chains.iter().map(|c| ess_tracer(c)).collect();
    let ess: f64 = ess_per_chain.iter().filter(|e| e.is_finite()).sum();
    Outcome::Diagnosed(ParameterDiagnostics {
        name: name.to_string(),
        ess_per_chain,
        ess,
        psrf: gelman_rubin(chains),
    })
}

pub fn diagnose(set: &ChainSet, control: &Control) -> Result<Diagnostics> {
    control.validate()?;
    init_threads(control.threads);
    let names = set.parameter_names();
    let per_param = |name: &String| -> Result<Outcome> {
        let chains = set
            .parameter(name)
            .ok_or_else(|| ReconError::Alignment(format!("Parameter '{}' missing", name)))?;
        Ok(diagnose_parameter(name, &chains))
    };
    let outcomes: Vec<Outcome> = if names.len() > 1 && available_threads() > 1 {
        names.par_iter().map(per_param).collect::<Result<Vec<_>>>()?
    } else {
        names.iter().map(per_param).collect::<Result<Vec<_>>>()?
    };

    let mut parameters = Vec::new();
    let mut excluded = Vec::new();
    for outcome in outcomes {
        match outcome {
            Outcome::Diagnosed(p) => parameters.push(p),
            Outcome::Excluded(name) => excluded.push(name),
        }
    }
    let (start, end, thin) = set.range();
    Ok(Diagnostics {
        n_chains: set.n_chains(),
        total_samples: set.total_samples(),
        start,
        end,
        thin,
        burn_in: set.chains()[0].burn_in,
        parameters,
        excluded,
    })
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StateSummary {
    pub node: String,
    pub state: String,
    pub n: usize,
    pub mean: f64,
    pub median: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Groups long-format rows by `(node, state)` in first-seen order and
/// summarizes each group with an equal-tailed credible interval.
pub fn summarize_states(rows: &[StateProbability], credible_mass: f64) -> Vec<StateSummary> {
    let mut order: Vec<StateKey> = Vec::new();
    let mut groups: HashMap<StateKey, Vec<f64>> = HashMap::new();
    for row in rows {
        let key = StateKey {
            node: row.node.clone(),
            state: row.state.clone(),
        };
        let values = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            Vec::new()
        });
        values.push(row.probability);
    }
    let tail = (1.0 - credible_mass) / 2.0;
    order
        .into_iter()
        .map(|key| {
            let mut values = groups.remove(&key).unwrap_or_default();
            values.sort_by(|a, b| a.total_cmp(b));
            StateSummary {
                n: values.len(),
                mean: mean(&values),
                median: quantile_sorted(&values, 0.5),
                lower: quantile_sorted(&values, tail),
                upper: quantile_sorted(&values, 1.0 - tail),
                node: key.node,
                state: key.state,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tests::synthetic_log;
    use crate::core::{ChainLog, ResultLog};
    use pretty_assertions::assert_eq;

    fn row(node: &str, state: &str, p: f64) -> StateProbability {
        StateProbability {
            chain_id: 1,
            iteration: 1,
            node: node.into(),
            state: state.into(),
            probability: p,
        }
    }

    #[test]
    fn ess_of_independent_draws_is_near_sample_size() {
        let x: Vec<f64> = (0..200).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        assert!(ess_tracer(&x) > 100.0);
        assert_eq!(ess_tracer(&[1.0]), 1.0);
    }

    #[test]
    fn min_ess_from_precision() {
        assert!((min_ess(0.01) - 625.0).abs() < 1e-9);
    }

    #[test]
    fn psrf_near_one_for_identical_chains() {
        let a: Vec<f64> = (0..100).map(|i| (i as f64 * 0.37).sin()).collect();
        let r = gelman_rubin(&[a.as_slice(), a.as_slice()]).unwrap();
        assert!(r < 1.01, "psrf {}", r);
    }

    #[test]
    fn psrf_large_for_separated_chains() {
        let a: Vec<f64> = (0..100).map(|i| (i as f64 * 0.37).sin()).collect();
        let b: Vec<f64> = a.iter().map(|v| v + 10.0).collect();
        let r = gelman_rubin(&[a.as_slice(), b.as_slice()]).unwrap();
        assert!(r > 2.0, "psrf {}", r);
    }

    #[test]
    fn psrf_needs_two_chains() {
        let a = [1.0, 2.0, 3.0];
        assert_eq!(gelman_rubin(&[&a[..]]), None);
    }

    #[test]
    fn quantiles_interpolate() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile_sorted(&v, 0.5), 2.5);
        assert_eq!(quantile_sorted(&v, 0.0), 1.0);
        assert_eq!(quantile_sorted(&v, 1.0), 4.0);
    }

    #[test]
    fn single_value_summary_round_trips() {
        let summary = summarize_states(&[row("3", "0", 0.7), row("3", "1", 0.3)], 0.95);
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].mean, 0.7);
        assert_eq!(summary[0].median, 0.7);
        assert_eq!(summary[1].mean, 0.3);
        assert_eq!((summary[1].lower, summary[1].upper), (0.3, 0.3));
    }

    #[test]
    fn summary_groups_by_node_and_state() {
        let rows = vec![
            row("5", "0", 0.2),
            row("6", "0", 0.9),
            row("5", "0", 0.4),
            row("5", "1", 0.8),
        ];
        let summary = summarize_states(&rows, 0.95);
        let keys: Vec<(&str, &str, usize)> = summary
            .iter()
            .map(|s| (s.node.as_str(), s.state.as_str(), s.n))
            .collect();
        assert_eq!(keys, vec![("5", "0", 2), ("6", "0", 1), ("5", "1", 1)]);
        assert!((summary[0].mean - 0.3).abs() < 1e-12);
    }

    #[test]
    fn diagnose_reports_every_parameter() {
        let re = Control::default().exclude_regex().unwrap();
        let chains = (1..=3)
            .map(|i| {
                ChainLog::from_result_log(i, ResultLog::parse(&synthetic_log(1000, 10, 400, i as u64)).unwrap(), &re)
                    .unwrap()
            })
            .collect();
        let set = ChainSet::new(chains).unwrap();
        let diag = diagnose(&set, &Control::default()).unwrap();
        assert_eq!(diag.total_samples, 1200);
        assert_eq!(diag.burn_in, Some(10000));
        assert_eq!(diag.excluded, vec!["Root P(0)".to_string()]);
        let names: Vec<&str> = diag.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Lh", "q01", "q10", "5.p.0", "5.p.1"]);
        for p in &diag.parameters {
            assert_eq!(p.ess_per_chain.len(), 3);
            assert!(p.psrf.is_some());
        }
    }
}
