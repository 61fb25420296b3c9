//! MixSeek CLI: thin shell over the execution kernel.
//!
//! Exit codes: 0 when at least one team completed, 1 on runtime failure or
//! when no team completed, 2 on invalid usage or configuration.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

use mixseek::config::{CliOverrides, OrchestratorSettings, Workspace};
use mixseek::engine::{create_member_agent, Evaluator, Orchestrator};
use mixseek::error::EngineError;
use mixseek::providers::ProviderFactory;

/// MixSeek: multi-team LLM orchestration with LLM-as-judge scoring.
#[derive(Parser, Debug)]
#[command(name = "mixseek")]
#[command(version)]
#[command(about = "Run competing LLM teams against one prompt, score every round, keep the best.", long_about = None)]
struct Cli {
    /// Workspace root (overrides MIXSEEK_WORKSPACE)
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize the workspace layout with sample configuration
    Init,

    /// Run a full execution across all configured teams
    Exec {
        /// The user prompt every team competes on
        prompt: String,

        /// Override max_rounds (CLI beats env beats TOML)
        #[arg(long)]
        max_rounds: Option<u32>,

        /// Override min_rounds
        #[arg(long)]
        min_rounds: Option<u32>,

        /// Output format for the execution summary
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },

    /// Run a single team once (no cross-team competition)
    Team {
        /// team_id from the workspace configuration
        team_id: String,

        /// The user prompt
        prompt: String,

        /// Persist rounds to the workspace store (default: throwaway store)
        #[arg(long)]
        save_db: bool,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },

    /// Score a submission file with the configured evaluator
    Evaluate {
        /// The original task prompt
        prompt: String,

        /// Path to the submission text to score
        submission_file: PathBuf,
    },

    /// Run one member agent standalone (debugging aid)
    Member {
        /// team_id that declares the member
        team_id: String,

        /// agent_name inside the team
        agent_name: String,

        /// The task to hand the member
        task: String,
    },

    /// Inspect or scaffold configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Write sample configuration files into the workspace
    Init,
    /// List configuration files in the workspace
    List,
    /// Print the resolved configuration with per-field provenance
    Show,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Respects RUST_LOG, defaults to info.
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    match run(cli).await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            match error {
                EngineError::Configuration(_) | EngineError::Authentication { .. } => {
                    ExitCode::from(2)
                }
                _ => ExitCode::from(1),
            }
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, EngineError> {
    match cli.command {
        Commands::Init => {
            let workspace =
                Workspace::new(OrchestratorSettings::resolve_workspace(cli.workspace.as_deref())?);
            workspace.scaffold()?;
            println!("initialized workspace at {}", workspace.root().display());
            Ok(ExitCode::SUCCESS)
        }

        Commands::Exec {
            prompt,
            max_rounds,
            min_rounds,
            output,
        } => {
            let settings = OrchestratorSettings::load(&CliOverrides {
                workspace: cli.workspace,
                max_rounds,
                min_rounds,
            })?;
            let orchestrator = Orchestrator::new(settings);
            let summary = orchestrator.execute(&prompt).await?;

            print_summary(&summary, output)?;
            if summary.completed_teams >= 1 {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(1))
            }
        }

        Commands::Team {
            team_id,
            prompt,
            save_db,
            output,
        } => {
            let mut settings = OrchestratorSettings::load(&CliOverrides {
                workspace: cli.workspace,
                ..CliOverrides::default()
            })?;
            settings.teams.retain(|t| t.team_id == team_id);
            if settings.teams.is_empty() {
                return Err(EngineError::Configuration(format!(
                    "no team with team_id '{team_id}' in the workspace configuration"
                )));
            }

            let factory =
                Arc::new(ProviderFactory::new(settings.evaluator.max_retries));
            let db_path = if save_db {
                Workspace::new(&settings.workspace_path).db_path()
            } else {
                // Throwaway store: the run is scored but leaves no trace.
                std::env::temp_dir().join(format!("mixseek-team-{}.db", uuid::Uuid::new_v4()))
            };
            let orchestrator = Orchestrator::with_factory(settings, factory, db_path.clone());
            let summary = orchestrator.execute(&prompt).await?;
            if !save_db {
                let _ = std::fs::remove_file(&db_path);
            }

            print_summary(&summary, output)?;
            if summary.completed_teams >= 1 {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(1))
            }
        }

        Commands::Evaluate {
            prompt,
            submission_file,
        } => {
            let settings = OrchestratorSettings::load(&CliOverrides {
                workspace: cli.workspace,
                ..CliOverrides::default()
            })?;
            let submission = std::fs::read_to_string(&submission_file).map_err(|e| {
                EngineError::Configuration(format!(
                    "cannot read {}: {e}",
                    submission_file.display()
                ))
            })?;

            let factory = Arc::new(ProviderFactory::new(settings.evaluator.max_retries));
            let evaluator = Evaluator::new(settings.evaluator, factory);
            let result = evaluator.evaluate(&prompt, &submission, "cli").await?;

            println!("overall score: {:.2}", result.overall_score);
            for metric in &result.metrics {
                println!("  {}: {:.1} — {}", metric.name, metric.score, metric.comment);
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Member {
            team_id,
            agent_name,
            task,
        } => {
            let settings = OrchestratorSettings::load(&CliOverrides {
                workspace: cli.workspace,
                ..CliOverrides::default()
            })?;
            let team = settings
                .teams
                .iter()
                .find(|t| t.team_id == team_id)
                .ok_or_else(|| {
                    EngineError::Configuration(format!("no team with team_id '{team_id}'"))
                })?;
            let spec = team
                .members
                .iter()
                .find(|m| m.agent_name == agent_name)
                .ok_or_else(|| {
                    EngineError::Configuration(format!(
                        "team '{team_id}' has no member '{agent_name}'"
                    ))
                })?;

            let factory = ProviderFactory::new(settings.evaluator.max_retries);
            let agent = create_member_agent(spec, &factory)?;
            let output = agent.run(&task).await?;

            println!("{}", output.content);
            tracing::info!(
                input_tokens = output.usage.input_tokens,
                output_tokens = output.usage.output_tokens,
                "member run finished"
            );
            Ok(ExitCode::SUCCESS)
        }

        Commands::Config { command } => run_config(command, cli.workspace),
    }
}

fn run_config(
    command: ConfigCommands,
    cli_workspace: Option<PathBuf>,
) -> Result<ExitCode, EngineError> {
    let workspace_root = OrchestratorSettings::resolve_workspace(cli_workspace.as_deref())?;
    let workspace = Workspace::new(&workspace_root);

    match command {
        ConfigCommands::Init => {
            workspace.scaffold()?;
            println!("wrote sample configs to {}", workspace.configs_dir().display());
            Ok(ExitCode::SUCCESS)
        }
        ConfigCommands::List => {
            let configs_dir = workspace.configs_dir();
            let entries = std::fs::read_dir(&configs_dir).map_err(|e| {
                EngineError::Configuration(format!("cannot read {}: {e}", configs_dir.display()))
            })?;
            let mut names: Vec<String> = entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|n| n.ends_with(".toml"))
                .collect();
            names.sort();
            for name in names {
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }
        ConfigCommands::Show => {
            let settings = OrchestratorSettings::load(&CliOverrides {
                workspace: Some(workspace_root),
                ..CliOverrides::default()
            })?;
            println!("workspace: {}", settings.workspace_path.display());
            println!(
                "rounds: min={} max={}",
                settings.min_rounds, settings.max_rounds
            );
            println!(
                "timeouts: team={}s submission={}s judgment={}s",
                settings.timeout_per_team_seconds,
                settings.submission_timeout_seconds,
                settings.judgment_timeout_seconds
            );
            println!("teams:");
            for team in &settings.teams {
                println!(
                    "  {} ({}) — {} member(s), leader {}",
                    team.team_name,
                    team.team_id,
                    team.members.len(),
                    team.leader.model
                );
            }
            println!("evaluator: {} metric(s)", settings.evaluator.metrics.len());
            println!("judge: {}", settings.judgment.model);
            println!("provenance:");
            for (field, source) in &settings.provenance {
                println!("  {field}: {source:?}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_summary(
    summary: &mixseek::engine::ExecutionSummary,
    output: OutputFormat,
) -> Result<(), EngineError> {
    match output {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(summary)
                .map_err(|e| EngineError::Configuration(format!("encode summary: {e}")))?;
            println!("{json}");
        }
        OutputFormat::Text => {
            println!("execution {}", summary.execution_id);
            println!(
                "teams: {} total, {} completed, {} failed",
                summary.total_teams, summary.completed_teams, summary.failed_teams
            );
            for status in &summary.team_statuses {
                let detail = status
                    .error_message
                    .as_deref()
                    .map(|m| format!(" — {m}"))
                    .unwrap_or_default();
                println!(
                    "  [{:?}] {} ({}), {} round(s){detail}",
                    status.status, status.team_name, status.team_id, status.current_round
                );
            }
            if let Some(best) = &summary.best_team_id {
                let result = summary
                    .team_results
                    .iter()
                    .find(|r| &r.team_id == best);
                if let Some(result) = result {
                    println!(
                        "\nbest team: {} (round {}, score {:.1})\n\n{}",
                        best, result.round_number, result.score, result.submission_content
                    );
                }
            } else {
                println!("\nno team completed a round");
            }
        }
    }
    Ok(())
}
