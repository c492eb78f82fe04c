use analystbox::config::{self, AppConfig, ModelBackend, ModelConfig};
use analystbox::{EventSink, Orchestrator, SessionEvent};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::{self, AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "analyst", version, about = "Sandboxed AI data analyst")]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Analyse files from the current directory inside the sandbox
    Run(RunArgs),

    /// Manage the model configuration
    #[command(subcommand)]
    Conf(ConfCommand),
}

#[derive(Args)]
struct RunArgs {
    /// Input files, relative to the current directory
    files: Vec<PathBuf>,

    /// What to analyse; asked interactively when omitted
    #[arg(short, long)]
    task: Option<String>,

    /// Print the outcome as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum ConfCommand {
    /// Write the model configuration
    Set {
        /// Model backend: hfapi or litellm
        #[arg(long = "type")]
        backend: ModelBackend,
        #[arg(long)]
        model_id: String,
        #[arg(long)]
        api_key: String,
        #[arg(long)]
        api_base: Option<String>,
    },
    /// Show the configuration with the API key masked
    Show,
    /// Delete the configuration file
    Delete,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "debug"
    } else {
        "analyst=info,analystbox=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Run(args) => run(args, cli.verbose).await,
        Command::Conf(cmd) => {
            conf(cmd)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(args: RunArgs, verbose: bool) -> anyhow::Result<ExitCode> {
    let config = AppConfig::load(&config::config_path()?)?;
    let task = match args.task {
        Some(task) => task,
        None => ask_task().await?,
    };
    if task.trim().is_empty() {
        anyhow::bail!("no task given");
    }

    let (events, mut rx) = EventSink::channel();
    let reporter = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                SessionEvent::Status(status) => eprintln!("[{status}]"),
                SessionEvent::Denied(attempt) => eprintln!("blocked write: {attempt}"),
                SessionEvent::Output(line) if verbose => eprintln!("  {line}"),
                SessionEvent::Output(_) => {}
            }
        }
    });

    let orchestrator = Orchestrator::from_config(&config)?.with_events(events);
    let cwd = std::env::current_dir()?;
    let cancel = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        eprintln!("Interrupted, stopping the sandbox...");
    };

    let outcome = orchestrator
        .run_until(&cwd, &args.files, &task, cancel)
        .await?;
    drop(orchestrator);
    let _ = reporter.await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{outcome}");
    }

    Ok(if outcome.is_complete_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn ask_task() -> anyhow::Result<String> {
    eprint!("What would you like me to analyze? ");
    let mut lines = BufReader::new(io::stdin()).lines();
    Ok(lines.next_line().await?.unwrap_or_default())
}

fn conf(cmd: ConfCommand) -> anyhow::Result<()> {
    let path = config::config_path()?;
    match cmd {
        ConfCommand::Set {
            backend,
            model_id,
            api_key,
            api_base,
        } => {
            let model = ModelConfig {
                backend,
                model_id,
                api_key,
                api_base: api_base.filter(|b| !b.trim().is_empty()),
            };
            // Keep sandbox settings from an existing file
            let config = match AppConfig::load(&path) {
                Ok(existing) => AppConfig {
                    model,
                    sandbox: existing.sandbox,
                },
                Err(_) => AppConfig::new(model),
            };
            config.save(&path)?;
            println!("Configuration saved to {}", path.display());
        }
        ConfCommand::Show => {
            let config = AppConfig::load(&path)?;
            let shown = AppConfig {
                model: config.model.redacted(),
                sandbox: config.sandbox,
            };
            println!("{}", path.display());
            println!("{}", serde_json::to_string_pretty(&shown)?);
        }
        ConfCommand::Delete => {
            if config::delete(&path)? {
                println!("Deleted {}", path.display());
            } else {
                println!("No configuration at {}", path.display());
            }
        }
    }
    Ok(())
}
