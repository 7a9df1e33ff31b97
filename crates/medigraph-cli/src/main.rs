use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use medigraph_common::config::{AppConfig, RunMode, SkipPolicy};
use medigraph_common::EntityKind;
use medigraph_core::{EtlReport, HealthReport, MediGraphEngine, QueryAnswer};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "medigraph")]
#[command(about = "MediGraph CLI - load warehouse records into the patient graph and query it", long_about = None)]
#[command(version)]
struct Cli {
    /// Output format
    #[arg(short, long, global = true, value_enum, default_value = "pretty")]
    output: OutputFormat,

    /// Overrides server.mode from the configuration
    #[arg(long, global = true, value_enum, env = "MEDIGRAPH_MODE")]
    mode: Option<ModeArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Demo,
    Live,
}

impl From<ModeArg> for RunMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Demo => RunMode::Demo,
            ModeArg::Live => RunMode::Live,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Copy warehouse rows into the graph
    Load {
        /// Entity kind to load (repeatable); all kinds when omitted
        #[arg(short, long = "entity")]
        entities: Vec<EntityKind>,

        /// Rows read per entity kind
        #[arg(long)]
        max_rows: Option<usize>,

        /// label-present or never
        #[arg(long)]
        skip_policy: Option<SkipPolicy>,
    },

    /// Check warehouse and graph connectivity
    Health,

    /// Write the built-in guideline nodes and link them into the graph
    SeedGuidelines,

    /// Answer a free-text question from the graph
    Ask {
        /// The question, e.g. "show medications for patient P001"
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so that `--output json` stays parseable.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!("No .env file loaded: {}", e);
    }

    let cli = Cli::parse();
    match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<ExitCode> {
    let mut config = AppConfig::load().context("Failed to load configuration")?;
    if let Some(mode) = cli.mode {
        config.server.mode = mode.into();
    }
    let engine = MediGraphEngine::connect(config).await?;

    match &cli.command {
        Commands::Load { entities, max_rows, skip_policy } => {
            let kinds = if entities.is_empty() {
                EntityKind::LOAD_ORDER.to_vec()
            } else {
                entities.clone()
            };
            let mut options = engine.default_load_options();
            if let Some(n) = max_rows {
                options.max_rows = *n;
            }
            if let Some(policy) = skip_policy {
                options.skip_policy = *policy;
            }

            let report = engine.load(&kinds, options).await;
            match cli.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Pretty => print_load(&report),
            }
            // Row failures are reported, not fatal. A kind that could not be
            // read or written at all is.
            Ok(if report.has_errors() { ExitCode::FAILURE } else { ExitCode::SUCCESS })
        }
        Commands::Health => {
            let health = engine.health().await;
            match cli.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&health)?),
                OutputFormat::Pretty => print_health(&health),
            }
            Ok(if health.ok() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Commands::SeedGuidelines => {
            let report = engine.seed_guidelines().await.context("Guideline seeding failed")?;
            match cli.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Pretty => {
                    println!(
                        "{} {} guidelines, {} new nodes, {} edges created, {} already present",
                        "Seeded".green().bold(),
                        report.guidelines,
                        report.nodes_created,
                        report.edges_created,
                        report.edges_existing
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Ask { question } => {
            if engine.mode() == RunMode::Demo {
                // The demo graph lives in this process only.
                engine.load(&EntityKind::LOAD_ORDER, engine.default_load_options()).await;
            }
            let answer = engine.query().ask(&question.join(" ")).await;
            match cli.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&answer)?),
                OutputFormat::Pretty => print_answer(&answer),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_load(report: &EtlReport) {
    println!(
        "{} run {} (max {} rows per entity, skip policy {:?})",
        "Load".cyan().bold(),
        report.run_id,
        report.max_rows,
        report.skip_policy
    );
    println!(
        "{:<13} {:>9} {:>7} {:>10} {:>7} {:>7} {:>6}",
        "entity", "available", "loaded", "not loaded", "nodes", "edges", "failed"
    );
    for r in &report.entities {
        let line = format!(
            "{:<13} {:>9} {:>7} {:>10} {:>7} {:>7} {:>6}",
            r.entity.plural(),
            r.rows_available,
            r.rows_loaded,
            r.rows_not_loaded,
            r.nodes_created,
            r.edges_created,
            r.failures.len()
        );
        if let Some(error) = &r.error {
            println!("{}  {}", line.red(), error);
        } else if r.skipped {
            println!("{}  {}", line.dimmed(), "skipped".yellow());
        } else {
            println!("{}", line);
        }
        for failure in r.failures.iter().take(5) {
            println!("    {} {}: {}", "!".yellow(), failure.row_key, failure.reason);
        }
        if r.failures.len() > 5 {
            println!("    ... and {} more", r.failures.len() - 5);
        }
    }
    println!(
        "{} {} nodes, {} edges, {} failed rows",
        "Total".green().bold(),
        report.nodes_created(),
        report.edges_created(),
        report.failed_rows()
    );
}

fn status_word(ok: bool) -> colored::ColoredString {
    if ok {
        "ok".green()
    } else {
        "down".red()
    }
}

fn print_health(health: &HealthReport) {
    println!("{}: {:?}", "mode".cyan().bold(), health.mode);

    let wh = &health.warehouse;
    println!("{} ({}): {}", "warehouse".cyan().bold(), wh.backend, status_word(wh.ok));
    if let Some(session) = &wh.session {
        println!(
            "  account={} region={} warehouse={} database={} schema={}",
            session.account.as_deref().unwrap_or("-"),
            session.region.as_deref().unwrap_or("-"),
            session.warehouse.as_deref().unwrap_or("-"),
            session.database.as_deref().unwrap_or("-"),
            session.schema.as_deref().unwrap_or("-")
        );
    }
    for (view, rows) in &wh.row_counts {
        println!("  {:<14} {}", view, rows.to_string().yellow());
    }
    if let Some(error) = &wh.error {
        println!("  {}", error.red());
    }

    let graph = &health.graph;
    println!("{} ({}): {}", "graph".cyan().bold(), graph.backend, status_word(graph.ok));
    for (label, nodes) in &graph.node_counts {
        println!("  {:<14} {}", label, nodes.to_string().yellow());
    }
    if let Some(error) = &graph.error {
        println!("  {}", error.red());
    }
}

fn print_answer(answer: &QueryAnswer) {
    if let Some(cypher) = &answer.cypher {
        println!("{}\n{}\n", "Cypher:".cyan().bold(), cypher.dimmed());
    }
    if let Some(message) = &answer.message {
        println!("{}", message.yellow());
    }
    if answer.rows.is_empty() {
        return;
    }
    println!("{}", answer.columns.join(" | ").bold());
    for row in &answer.rows {
        let cells: Vec<String> = row
            .iter()
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        println!("{}", cells.join(" | "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_load_arguments() {
        let cli = Cli::try_parse_from([
            "medigraph", "load", "--entity", "patients", "-e", "Encounter", "--max-rows", "100", "--skip-policy", "never",
        ])
        .unwrap();
        match cli.command {
            Commands::Load { entities, max_rows, skip_policy } => {
                assert_eq!(entities, vec![EntityKind::Patient, EntityKind::Encounter]);
                assert_eq!(max_rows, Some(100));
                assert_eq!(skip_policy, Some(SkipPolicy::Never));
            }
            _ => panic!("expected load"),
        }
    }

    #[test]
    fn test_unknown_entity_is_rejected() {
        assert!(Cli::try_parse_from(["medigraph", "load", "--entity", "claims"]).is_err());
    }

    #[test]
    fn test_ask_joins_words() {
        let cli = Cli::try_parse_from(["medigraph", "--output", "json", "ask", "show", "patients", "with", "diabetes"]).unwrap();
        assert!(matches!(cli.output, OutputFormat::Json));
        match cli.command {
            Commands::Ask { question } => assert_eq!(question.join(" "), "show patients with diabetes"),
            _ => panic!("expected ask"),
        }
    }

    #[test]
    fn test_mode_override() {
        let cli = Cli::try_parse_from(["medigraph", "health", "--mode", "live"]).unwrap();
        assert_eq!(cli.mode.map(RunMode::from), Some(RunMode::Live));
        assert!(matches!(cli.command, Commands::Health));
    }
}
