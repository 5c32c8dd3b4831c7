use std::error::Error;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use ancStateRecon::columns::reshape_long;
use ancStateRecon::commands::{Analysis, McmcSettings};
use ancStateRecon::diagnostics::{diagnose, min_ess, summarize_states};
use ancStateRecon::{
    commands_for, load_chain_set, node_tag_commands, read_tree_file, render_commands, Control,
    ControlFile, NodeTagCommand, TraitTable,
};
use clap::{Parser, Subcommand};
use log::info;

#[derive(Debug, Parser)]
#[clap(name = "ancrecon_cli")]
#[clap(about = "Node tagging and multi-chain log aggregation for ancestral state reconstruction.", long_about = None)]
struct Cli {
    /// Log progress to stderr
    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print AddTag/AddNode lines for every internal node
    #[clap(arg_required_else_help = true)]
    Tags {
        /// Newick or NEXUS tree file
        #[clap(short, long, value_parser, required = true)]
        tree: PathBuf,

        /// whitespace-delimited trait table checked against the tree leaves
        #[clap(long, value_parser)]
        traits: Option<PathBuf>,

        /// output path for the command lines
        #[clap(short, long, value_parser, default_value = "/dev/stdout")]
        output: PathBuf,
    },

    /// Write a complete MultiState command file ending in Run
    #[clap(arg_required_else_help = true)]
    Control {
        /// Newick or NEXUS tree file
        #[clap(short, long, value_parser, required = true)]
        tree: PathBuf,

        /// whitespace-delimited trait table checked against the tree leaves
        #[clap(long, value_parser)]
        traits: Option<PathBuf>,

        /// run MCMC instead of maximum likelihood
        #[clap(long, value_parser, default_value_t = false)]
        mcmc: bool,

        /// MCMC iterations
        #[clap(long, value_parser, default_value_t = 1_010_000, requires = "mcmc")]
        iterations: u64,

        /// MCMC burn-in iterations
        #[clap(long, value_parser, default_value_t = 10_000, requires = "mcmc")]
        burnin: u64,

        /// MCMC sample period
        #[clap(long, value_parser, default_value_t = 1_000, requires = "mcmc")]
        sample: u64,

        /// LogFile name passed to the reconstruction tool
        #[clap(long, value_parser)]
        log_file: Option<String>,

        /// output path for the command file
        #[clap(short, long, value_parser, default_value = "/dev/stdout")]
        output: PathBuf,
    },

    /// Combine per-chain result logs and report convergence diagnostics
    #[clap(arg_required_else_help = true)]
    Aggregate {
        /// comma-separated result logs, one per chain
        #[clap(short, long, value_parser, value_delimiter = ',', required = true)]
        files: Vec<PathBuf>,

        /// ESS precision threshold
        #[clap(long, value_parser)]
        precision: Option<f64>,

        /// maximum acceptable PSRF
        #[clap(long, value_parser)]
        psrf_threshold: Option<f64>,

        /// mass of the per-node credible interval
        #[clap(long, value_parser)]
        credible_mass: Option<f64>,

        /// regex for identifier columns to drop
        #[clap(long, value_parser)]
        names_to_exclude: Option<String>,

        /// number of threads for parsing and diagnostics
        #[clap(short = 'j', long, value_parser)]
        threads: Option<usize>,

        /// write long-format state probabilities as TSV
        #[clap(long, value_parser)]
        long_output: Option<PathBuf>,

        /// emit a single JSON object
        #[clap(long, value_parser, default_value_t = false, conflicts_with = "tsv")]
        json: bool,

        /// emit TSV tables
        #[clap(long, value_parser, default_value_t = false)]
        tsv: bool,
    },
}

fn load_tags(tree: &Path, traits: Option<&PathBuf>) -> Result<Vec<NodeTagCommand>, Box<dyn Error>> {
    let tree = read_tree_file(tree)?;
    let tags = match traits {
        Some(path) => commands_for(&tree, &TraitTable::from_path(path)?)?,
        None => node_tag_commands(&tree),
    };
    info!("{} nodes tagged", tags.len());
    Ok(tags)
}

fn write_text(output: &Path, text: &str) -> Result<(), Box<dyn Error>> {
    let mut out = File::create(output)?;
    out.write_all(text.as_bytes())?;
    Ok(())
}

fn run_aggregate(
    files: Vec<PathBuf>,
    control: Control,
    long_output: Option<PathBuf>,
    json: bool,
    tsv: bool,
) -> Result<(), Box<dyn Error>> {
    let set = load_chain_set(&files, &control)?;
    let diag = diagnose(&set, &control)?;
    let long = reshape_long(&set)?;
    let summary = summarize_states(&long, control.credible_mass);
    let failures = diag.failures(&control);
    let converged = failures.is_empty();

    if let Some(path) = long_output {
        let mut wtr = csv::WriterBuilder::new().delimiter(b'\t').from_path(&path)?;
        for row in &long {
            wtr.serialize(row)?;
        }
        wtr.flush()?;
        info!("Wrote {} state probability rows to {}", long.len(), path.display());
    }

    if json {
        let report = serde_json::json!({
            "converged": converged,
            "failures": failures,
            "diagnostics": diag,
            "states": summary,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if tsv {
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(io::stdout().lock());
        wtr.write_record(["parameter", "ess", "psrf"])?;
        for p in &diag.parameters {
            let psrf = p.psrf.map(|r| r.to_string()).unwrap_or_else(|| "NA".to_string());
            let ess = p.ess.to_string();
            wtr.write_record([p.name.as_str(), ess.as_str(), psrf.as_str()])?;
        }
        wtr.flush()?;
        drop(wtr);
        println!();
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(io::stdout().lock());
        for s in &summary {
            wtr.serialize(s)?;
        }
        wtr.flush()?;
        return Ok(());
    }

    println!("converged: {}", converged);
    println!(
        "chains: {}  samples: {}  iterations: {}..{} every {}",
        diag.n_chains, diag.total_samples, diag.start, diag.end, diag.thin
    );
    if let Some(burn_in) = diag.burn_in {
        println!("burn-in: {}", burn_in);
    }
    println!("minimum ESS: {:.0}", min_ess(control.precision));
    for p in &diag.parameters {
        let psrf = p.psrf.map(|r| format!("{:.3}", r)).unwrap_or_else(|| "NA".to_string());
        println!("  {:<24} ESS {:>10.1}  PSRF {}", p.name, p.ess, psrf);
    }
    if !diag.excluded.is_empty() {
        println!("excluded: {}", diag.excluded.join(", "));
    }
    for f in &failures {
        println!("  failed: {}", f);
    }
    println!("states:");
    for s in &summary {
        println!(
            "  node {:<6} state {:<4} median {:.4}  [{:.4}, {:.4}]  n={}",
            s.node, s.state, s.median, s.lower, s.upper, s.n
        );
    }
    Ok(())
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    match cli.command {
        Commands::Tags {
            tree,
            traits,
            output,
        } => {
            let tags = load_tags(&tree, traits.as_ref())?;
            let mut text = render_commands(&tags).join("\n");
            if !text.is_empty() {
                text.push('\n');
            }
            write_text(&output, &text)?;
        }

        Commands::Control {
            tree,
            traits,
            mcmc,
            iterations,
            burnin,
            sample,
            log_file,
            output,
        } => {
            let tags = load_tags(&tree, traits.as_ref())?;
            let analysis = if mcmc {
                Analysis::Mcmc
            } else {
                Analysis::MaximumLikelihood
            };
            let mut control = ControlFile::new(analysis, tags);
            if mcmc {
                control.mcmc = Some(McmcSettings {
                    iterations,
                    burnin,
                    sample_period: sample,
                });
            }
            control.log_file = log_file;
            write_text(&output, &control.render()?)?;
        }

        Commands::Aggregate {
            files,
            precision,
            psrf_threshold,
            credible_mass,
            names_to_exclude,
            threads,
            long_output,
            json,
            tsv,
        } => {
            let mut control = Control::default();
            if let Some(val) = precision {
                control.precision = val;
            }
            if let Some(val) = psrf_threshold {
                control.psrf_threshold = val;
            }
            if let Some(val) = credible_mass {
                control.credible_mass = val;
            }
            if let Some(val) = names_to_exclude {
                control.names_to_exclude = val;
            }
            if let Some(val) = threads {
                if val > 0 {
                    control.threads = Some(val);
                }
            }
            run_aggregate(files, control, long_output, json, tsv)?;
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    if let Err(err) = run(cli) {
        eprintln!("ancrecon_cli: {}", err);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mcmc_settings_require_mcmc_flag() {
        let err = Cli::try_parse_from(["ancrecon_cli", "control", "--tree", "t.nwk", "--iterations", "500"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);

        let cli = Cli::try_parse_from([
            "ancrecon_cli",
            "control",
            "--tree",
            "t.nwk",
            "--mcmc",
            "--iterations",
            "500",
        ])
        .unwrap();
        match cli.command {
            Commands::Control { mcmc, iterations, burnin, .. } => {
                assert!(mcmc);
                assert_eq!(iterations, 500);
                assert_eq!(burnin, 10_000);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn tags_writes_tag_and_node_lines() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree.nwk");
        let output = dir.path().join("tags.txt");
        std::fs::write(&tree, "((A,B),C);\n").unwrap();
        let cli = Cli::try_parse_from([
            "ancrecon_cli",
            "tags",
            "--tree",
            tree.to_str().unwrap(),
            "--output",
            output.to_str().unwrap(),
        ])
        .unwrap();
        run(cli).unwrap();
        let text = std::fs::read_to_string(&output).unwrap();
        assert_eq!(text, "AddTag T4 A B C\nAddNode 4 T4\nAddTag T5 A B\nAddNode 5 T5\n");
    }
}
