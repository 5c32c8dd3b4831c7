use crate::error::{ReconError, Result};
use log::{debug, info};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Once, OnceLock};

mod build_threads {
    include!(concat!(env!("OUT_DIR"), "/threads.rs"));
}

static INIT_RAYON: Once = Once::new();

#[derive(Clone, Debug, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub columns: Vec<Vec<f64>>,
}

impl Table {
    pub fn nrows(&self) -> usize {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }

    pub(crate) fn select_columns(&self, keep: &[bool]) -> Table {
        let mut headers = Vec::new();
        let mut columns = Vec::new();
        for (i, k) in keep.iter().enumerate() {
            if *k {
                headers.push(self.headers[i].clone());
                columns.push(self.columns[i].clone());
            }
        }
        Table { headers, columns }
    }

    /// Columns rearranged to follow `names`, or `None` when the header sets
    /// differ.
    pub(crate) fn reordered(&self, names: &[String]) -> Option<Table> {
        if names.len() != self.headers.len() {
            return None;
        }
        let mut columns = Vec::with_capacity(names.len());
        for name in names {
            columns.push(self.columns[self.column_index(name)?].clone());
        }
        Some(Table {
            headers: names.to_vec(),
            columns,
        })
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.column_index(name).map(|i| self.columns[i].as_slice())
    }
}

#[derive(Clone, Debug)]
pub struct Control {
    /// Identifier columns dropped from the sampled parameters.
    pub names_to_exclude: String,
    /// ESS precision; the minimum acceptable ESS is derived from it.
    pub precision: f64,
    pub psrf_threshold: f64,
    pub credible_mass: f64,
    pub threads: Option<usize>,
}

impl Default for Control {
    fn default() -> Self {
        Self {
            names_to_exclude: "^(Iteration|Tree No|Tree\\.No|TreeNo)$".to_string(),
            precision: 0.01,
            psrf_threshold: 1.1,
            credible_mass: 0.95,
            threads: None,
        }
    }
}

impl Control {
    pub fn validate(&self) -> Result<()> {
        if !(self.precision > 0.0 && self.precision < 1.0) {
            return Err(ReconError::Control(format!(
                "precision must be in (0, 1), got {}",
                self.precision
            )));
        }
        if !(self.credible_mass > 0.0 && self.credible_mass < 1.0) {
            return Err(ReconError::Control(format!(
                "credible mass must be in (0, 1), got {}",
                self.credible_mass
            )));
        }
        if self.psrf_threshold < 1.0 {
            return Err(ReconError::Control(format!(
                "PSRF threshold must be at least 1, got {}",
                self.psrf_threshold
            )));
        }
        Ok(())
    }

    pub(crate) fn exclude_regex(&self) -> Result<Regex> {
        Regex::new(&self.names_to_exclude)
            .map_err(|e| ReconError::Control(format!("names to exclude: {}", e)))
    }
}

/// One result log split into its option header and its iteration table.
#[derive(Clone, Debug)]
pub struct ResultLog {
    pub options: Vec<(String, String)>,
    pub table: Table,
}

fn sample_period_key() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^sample\s*period$").expect("valid regex"))
}

fn burn_in_key() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^burn[\s-]*in$").expect("valid regex"))
}

fn leading_number(value: &str) -> Option<f64> {
    value.split_whitespace().next()?.parse::<f64>().ok()
}

fn is_missing(cell: &str) -> bool {
    matches!(cell, "" | "NA" | "NaN" | "nan" | "-")
}

fn split_fields(line: &str, tabbed: bool) -> Vec<&str> {
    let line = line.trim_end_matches(['\r', '\n']);
    if tabbed {
        line.split('\t').map(|s| s.trim()).collect()
    } else {
        line.split_whitespace().collect()
    }
}

impl ResultLog {
    /// Parses option lines up to the table header (the first line whose
    /// leading field is `Iteration`), then one numeric row per line. Missing
    /// cells become NaN; a row with the wrong number of fields is an error.
    pub fn parse(content: &str) -> Result<ResultLog> {
        let mut options = Vec::new();
        let mut lines = content.lines().enumerate();

        let mut header: Option<(Vec<String>, bool)> = None;
        for (_, line) in lines.by_ref() {
            let tabbed = line.contains('\t');
            let fields = split_fields(line, tabbed);
            if fields.first().map(|f| *f == "Iteration").unwrap_or(false) {
                let mut headers: Vec<String> = fields.iter().map(|s| s.to_string()).collect();
                while headers.last().map(|h| h.is_empty()).unwrap_or(false) {
                    headers.pop();
                }
                header = Some((headers, tabbed));
                break;
            }
            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim();
                if !key.is_empty() {
                    options.push((key.to_string(), value.trim().to_string()));
                }
            }
        }
        let (headers, tabbed) = header.ok_or_else(|| {
            ReconError::Format("No table header starting with 'Iteration' found".into())
        })?;

        let mut columns: Vec<Vec<f64>> = vec![Vec::new(); headers.len()];
        for (line_no, line) in lines {
            if line.trim().is_empty() {
                continue;
            }
            let fields = split_fields(line, tabbed);
            let extra_blank = fields.iter().skip(headers.len()).all(|f| f.is_empty());
            if fields.len() < headers.len() || !extra_blank {
                return Err(ReconError::Format(format!(
                    "Line {} has {} fields for {} columns",
                    line_no + 1,
                    fields.len(),
                    headers.len()
                )));
            }
            for (i, cell) in fields.iter().take(headers.len()).enumerate() {
                let val = if is_missing(cell) {
                    f64::NAN
                } else {
                    cell.parse::<f64>().map_err(|_| {
                        ReconError::Format(format!(
                            "Non-numeric value '{}' in column '{}' on line {}",
                            cell,
                            headers[i],
                            line_no + 1
                        ))
                    })?
                };
                columns[i].push(val);
            }
        }
        debug!("Parsed {} rows of {} columns", columns[0].len(), headers.len());

        Ok(ResultLog {
            options,
            table: Table { headers, columns },
        })
    }

    pub fn from_path(path: &Path) -> Result<ResultLog> {
        let content = fs::read_to_string(path).map_err(|e| ReconError::io(path, e))?;
        ResultLog::parse(&content).map_err(|e| match e {
            ReconError::Format(msg) => {
                ReconError::Format(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    pub fn option(&self, key: &Regex) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| key.is_match(k))
            .map(|(_, v)| v.as_str())
    }

    /// Thinning interval from the "Sample Period" option.
    pub fn sample_period(&self) -> Result<u64> {
        let raw = self
            .option(sample_period_key())
            .ok_or_else(|| ReconError::Format("Sample Period setting not found".into()))?;
        match leading_number(raw) {
            Some(v) if v >= 1.0 && v.fract() == 0.0 => Ok(v as u64),
            _ => Err(ReconError::Format(format!(
                "Unparsable Sample Period '{}'",
                raw
            ))),
        }
    }

    pub fn burn_in(&self) -> Option<u64> {
        self.option(burn_in_key())
            .and_then(leading_number)
            .filter(|v| *v >= 0.0 && v.fract() == 0.0)
            .map(|v| v as u64)
    }
}

pub(crate) fn filter_table(table: &Table, names_to_exclude: &Regex) -> Table {
    let keep: Vec<bool> = table
        .headers
        .iter()
        .map(|h| !names_to_exclude.is_match(h))
        .collect();
    table.select_columns(&keep)
}

/// Retained post-burn-in samples of one chain.
#[derive(Clone, Debug)]
pub struct ChainLog {
    pub chain_id: usize,
    pub options: Vec<(String, String)>,
    pub start: u64,
    pub end: u64,
    pub thin: u64,
    pub burn_in: Option<u64>,
    pub iterations: Vec<u64>,
    pub params: Table,
}

impl ChainLog {
    pub fn from_result_log(chain_id: usize, log: ResultLog, names_to_exclude: &Regex) -> Result<ChainLog> {
        let thin = log.sample_period()?;
        let burn_in = log.burn_in();
        let raw = log
            .table
            .column("Iteration")
            .ok_or_else(|| ReconError::Format("Missing Iteration column".into()))?;
        if raw.is_empty() {
            return Err(ReconError::Format(format!(
                "Chain {} has no retained iterations",
                chain_id
            )));
        }
        let mut iterations = Vec::with_capacity(raw.len());
        for v in raw {
            if !v.is_finite() || *v < 0.0 || v.fract() != 0.0 {
                return Err(ReconError::Format(format!(
                    "Chain {} has invalid iteration value {}",
                    chain_id, v
                )));
            }
            iterations.push(*v as u64);
        }
        let start = iterations.iter().copied().min().unwrap_or(0);
        let end = iterations.iter().copied().max().unwrap_or(0);

        let span = end - start;
        let expected = span / thin + 1;
        let evenly_spaced = iterations
            .windows(2)
            .all(|w| w[1] > w[0] && w[1] - w[0] == thin);
        if span % thin != 0 || expected as usize != iterations.len() || !evenly_spaced {
            return Err(ReconError::Format(format!(
                "Chain {}: {} iterations from {} to {} do not match sample period {}",
                chain_id,
                iterations.len(),
                start,
                end,
                thin
            )));
        }

        let params = filter_table(&log.table, names_to_exclude);
        debug!(
            "Chain {}: start {} end {} thin {} with {} parameters",
            chain_id,
            start,
            end,
            thin,
            params.headers.len()
        );
        Ok(ChainLog {
            chain_id,
            options: log.options,
            start,
            end,
            thin,
            burn_in,
            iterations,
            params,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.iterations.len()
    }

    pub fn range(&self) -> (u64, u64, u64) {
        (self.start, self.end, self.thin)
    }
}

/// Chains sharing parameter names and `(start, end, thin)`. Only built
/// through [`ChainSet::new`].
#[derive(Clone, Debug)]
pub struct ChainSet {
    chains: Vec<ChainLog>,
}

impl ChainSet {
    /// Validates the chains against the first one. Columns of later chains
    /// are rearranged into the first chain's order when the name sets match.
    pub fn new(mut chains: Vec<ChainLog>) -> Result<ChainSet> {
        let (first, rest) = chains
            .split_first_mut()
            .ok_or_else(|| ReconError::Alignment("No chains to combine".into()))?;
        for chain in rest.iter_mut() {
            if chain.params.headers != first.params.headers {
                if let Some(params) = chain.params.reordered(&first.params.headers) {
                    debug!(
                        "Chain {}: parameter columns reordered to match chain {}",
                        chain.chain_id, first.chain_id
                    );
                    chain.params = params;
                }
            }
            if chain.params.headers != first.params.headers {
                let missing: Vec<&str> = first
                    .params
                    .headers
                    .iter()
                    .filter(|h| !chain.params.headers.contains(h))
                    .map(|h| h.as_str())
                    .collect();
                let extra: Vec<&str> = chain
                    .params
                    .headers
                    .iter()
                    .filter(|h| !first.params.headers.contains(h))
                    .map(|h| h.as_str())
                    .collect();
                return Err(ReconError::Alignment(format!(
                    "Chain {} parameters differ from chain {} (missing: [{}], extra: [{}])",
                    chain.chain_id,
                    first.chain_id,
                    missing.join(", "),
                    extra.join(", ")
                )));
            }
            if chain.range() != first.range() {
                let (s1, e1, t1) = first.range();
                let (s2, e2, t2) = chain.range();
                return Err(ReconError::Alignment(format!(
                    "Chain {} spans {}..{} thin {} but chain {} spans {}..{} thin {}",
                    chain.chain_id, s2, e2, t2, first.chain_id, s1, e1, t1
                )));
            }
        }
        Ok(ChainSet { chains })
    }

    pub fn chains(&self) -> &[ChainLog] {
        &self.chains
    }

    pub fn n_chains(&self) -> usize {
        self.chains.len()
    }

    pub fn total_samples(&self) -> usize {
        self.chains.iter().map(|c| c.n_samples()).sum()
    }

    pub fn parameter_names(&self) -> &[String] {
        &self.chains[0].params.headers
    }

    pub fn range(&self) -> (u64, u64, u64) {
        self.chains[0].range()
    }

    /// Per-chain samples of one parameter, in chain order.
    pub fn parameter(&self, name: &str) -> Option<Vec<&[f64]>> {
        let idx = self.chains[0].params.column_index(name)?;
        Some(
            self.chains
                .iter()
                .map(|c| c.params.columns[idx].as_slice())
                .collect(),
        )
    }
}

pub(crate) fn init_threads(threads: Option<usize>) {
    let desired = threads.unwrap_or(build_threads::DEFAULT_THREADS).max(1);
    INIT_RAYON.call_once(|| {
        let _ = ThreadPoolBuilder::new().num_threads(desired).build_global();
    });
}

pub(crate) fn available_threads() -> usize {
    rayon::current_num_threads().max(1)
}

fn load_chain(chain_id: usize, path: &Path, names_re: &Regex) -> Result<ChainLog> {
    info!("Reading chain {} from {}", chain_id, path.display());
    let log = ResultLog::from_path(path)?;
    ChainLog::from_result_log(chain_id, log, names_re).map_err(|e| match e {
        ReconError::Format(msg) => ReconError::Format(format!("{}: {}", path.display(), msg)),
        other => other,
    })
}

/// Reads one chain per path (chain ids follow input order) and combines them.
pub fn load_chain_set(paths: &[PathBuf], control: &Control) -> Result<ChainSet> {
    control.validate()?;
    init_threads(control.threads);
    let names_re = control.exclude_regex()?;
    if paths.is_empty() {
        return Err(ReconError::Alignment("No chain logs given".into()));
    }

    let use_parallel = paths.len() > 1 && available_threads() > 1;
    let chains: Vec<ChainLog> = if use_parallel {
        paths
            .par_iter()
            .enumerate()
            .map(|(i, p)| load_chain(i + 1, p, &names_re))
            .collect::<Result<Vec<_>>>()?
    } else {
        paths
            .iter()
            .enumerate()
            .map(|(i, p)| load_chain(i + 1, p, &names_re))
            .collect::<Result<Vec<_>>>()?
    };
    let set = ChainSet::new(chains)?;
    info!(
        "Combined {} chains, {} samples in total",
        set.n_chains(),
        set.total_samples()
    );
    Ok(set)
}
