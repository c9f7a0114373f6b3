use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ralph_supervisor::analyzer::{AgentStateAnalysis, AnalysisContext, Conclusion, OutputAnalyzer};
use ralph_supervisor::config::SupervisorConfig;
use ralph_supervisor::error::{Result, SupervisorError};
use ralph_supervisor::event::{ContinuationEvent, EventSource};
use ralph_supervisor::supervisor::{ContinuationSupervisor, DispatchedResult};

/// Ralph Supervisor: decide what a coding agent session needs next
#[derive(Parser, Debug)]
#[command(name = "ralph-supervisor")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file (TOML format)
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify a terminal capture
    Analyze {
        /// File holding the output (reads stdin when omitted)
        file: Option<PathBuf>,

        /// Exit code of the agent process, if it exited
        #[arg(long = "exit-code", allow_hyphen_values = true)]
        exit_code: Option<i32>,

        /// Evaluations already spent on this session
        #[arg(short = 'i', long = "iterations", default_value_t = 0)]
        iterations: u32,

        /// Iteration limit (default from config)
        #[arg(short = 'm', long = "max-iterations")]
        max_iterations: Option<u32>,

        /// Task the session is working on
        #[arg(short = 't', long = "task")]
        task: Option<String>,

        /// Print the analysis as JSON
        #[arg(long = "json")]
        json: bool,
    },
    /// Feed a JSON-lines file of continuation events through a supervisor
    Replay {
        /// File with one event per line
        file: PathBuf,

        /// Iteration limit for new sessions (default from config)
        #[arg(short = 'm', long = "max-iterations")]
        max_iterations: Option<u32>,

        /// Require approval before assigning the next task
        #[arg(long = "no-auto-assign")]
        no_auto_assign: bool,

        /// Print results as JSON lines
        #[arg(long = "json")]
        json: bool,
    },
}

fn setup_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("ralph_supervisor=debug,info")
    } else {
        EnvFilter::new("ralph_supervisor=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn read_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path).map_err(SupervisorError::InputError),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .map_err(SupervisorError::InputError)?;
            Ok(buf)
        }
    }
}

fn conclusion_label(conclusion: Conclusion) -> colored::ColoredString {
    let label = conclusion.to_string();
    match conclusion {
        Conclusion::TaskComplete => label.green().bold(),
        Conclusion::Incomplete => label.cyan().bold(),
        Conclusion::StuckOrError | Conclusion::MaxIterations => label.red().bold(),
        Conclusion::WaitingInput => label.yellow().bold(),
        Conclusion::Unknown => label.dimmed(),
    }
}

fn print_analysis(analysis: &AgentStateAnalysis) {
    println!(
        "{} {} (confidence {:.2})",
        "CONCLUSION:".bold(),
        conclusion_label(analysis.conclusion),
        analysis.confidence
    );
    println!("{} {}", "RECOMMENDATION:".bold(), analysis.recommendation.to_string().cyan());
    println!(
        "{} {}/{}",
        "ITERATIONS:".bold(),
        analysis.iterations,
        analysis.max_iterations
    );
    if let Some(ref task) = analysis.current_task {
        println!("{} {}", "TASK:".bold(), task);
    }
    for line in &analysis.evidence {
        println!("  - {}", line);
    }
    if let Some(ref error) = analysis.error {
        println!("{} {}", "ERROR TYPE:".bold(), error.error_type.to_string().red());
        for line in error.error_message.lines() {
            println!("  | {}", line);
        }
        for frame in &error.stack_trace {
            println!("    {}", frame.dimmed());
        }
    }
}

fn print_dispatched(dispatched: &DispatchedResult) {
    let result = &dispatched.result;
    if !result.success {
        println!(
            "{} [{}] {}: {}",
            "FAILED:".red().bold(),
            dispatched.trigger,
            dispatched.session_name.cyan(),
            result.error.as_deref().unwrap_or("unknown error")
        );
        return;
    }
    let conclusion = result
        .analysis
        .as_ref()
        .map(|a| conclusion_label(a.conclusion).to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "[{}] {}: {} -> {}",
        dispatched.trigger,
        dispatched.session_name.cyan(),
        conclusion,
        result.action.to_string().bold()
    );
    for line in result.message.lines() {
        println!("    {}", line);
    }
}

fn run_analyze(file: Option<&Path>, context: AnalysisContext, json: bool) -> Result<()> {
    let output = read_input(file)?;
    let session = file
        .and_then(|p| p.file_stem())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "stdin".to_string());

    let analysis = OutputAnalyzer::new().classify(&session, &output, &context);
    info!("Analyzed {} bytes from {}", output.len(), session);

    if json {
        match serde_json::to_string_pretty(&analysis) {
            Ok(text) => println!("{}", text),
            Err(e) => warn!("Failed to encode analysis: {}", e),
        }
    } else {
        print_analysis(&analysis);
    }
    Ok(())
}

async fn run_replay(config: SupervisorConfig, file: &Path, json: bool) -> Result<()> {
    let content = std::fs::read_to_string(file).map_err(SupervisorError::InputError)?;

    let supervisor = Arc::new(ContinuationSupervisor::new(&config));
    let source = EventSource::new(config.event_capacity);
    let mut results = supervisor.subscribe_results();
    supervisor.start(&source).await;

    for (number, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event = match ContinuationEvent::from_json(line) {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping line {}: {}", number + 1, e);
                continue;
            }
        };

        if source.publish(event) == 0 {
            warn!("Supervisor is not subscribed; stopping replay");
            break;
        }

        // One event in flight at a time keeps output in input order
        let dispatched = match results.recv().await {
            Ok(dispatched) => dispatched,
            Err(e) => {
                warn!("Result stream ended: {}", e);
                break;
            }
        };

        if json {
            match serde_json::to_string(&dispatched) {
                Ok(text) => println!("{}", text),
                Err(e) => warn!("Failed to encode result: {}", e),
            }
        } else {
            print_dispatched(&dispatched);
        }
    }

    supervisor.stop().await;

    if !json {
        let pending = supervisor.notifications(true).await;
        if !pending.is_empty() {
            println!("\n{} {}", "NOTIFICATIONS:".yellow().bold(), pending.len());
            for notification in pending {
                println!(
                    "  {} {}",
                    notification.timestamp.format("%H:%M:%S").to_string().dimmed(),
                    notification.message
                );
            }
        }
        println!(
            "\n{} {}",
            "MONITORED:".bold(),
            supervisor.active_monitors().await.join(", ")
        );
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut config = match SupervisorConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Analyze {
            ref file,
            exit_code,
            iterations,
            max_iterations,
            ref task,
            json,
        } => {
            config.merge_cli_args(max_iterations, None);
            let context = AnalysisContext {
                current_task: task.clone(),
                iterations,
                max_iterations: config.defaults.max_iterations,
                exit_code,
            };
            run_analyze(file.as_deref(), context, json)
        }
        Command::Replay {
            ref file,
            max_iterations,
            no_auto_assign,
            json,
        } => {
            config.merge_cli_args(max_iterations, no_auto_assign.then_some(false));
            run_replay(config, file, json).await
        }
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}
