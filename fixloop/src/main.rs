//! Run model-generated code and repair it with model feedback.
//!
//! Reads fenced code blocks from a file (or stdin), executes them per
//! language, and for `run` feeds failures back to a model CLI until the code
//! works or the attempt budget is spent.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use fixloop::core::extract::extract_fragments;
use fixloop::core::language::Language;
use fixloop::core::types::{CodeFragment, ExecutionResult};
use fixloop::dispatch::{Execute, LanguageDispatcher};
use fixloop::exit_codes;
use fixloop::io::completion::CommandClient;
use fixloop::io::config::{DEFAULT_CONFIG_FILE, EngineConfig, load_config};
use fixloop::io::deploy::{DeployContent, DeploymentManager, LaunchOutcome};
use fixloop::io::device::AdbBridge;
use fixloop::io::process::minimal_env;
use fixloop::logging;
use fixloop::retry::{RetryOrchestrator, RetryRequest, RetrySettings, RetryStop};

#[derive(Parser)]
#[command(
    name = "fixloop",
    version,
    about = "Run model-generated code and repair it with model feedback"
)]
struct Cli {
    /// Config file (TOML). A missing file means defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Log at debug level unless RUST_LOG is set.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute every code block once. With `--lang`, the whole input is one fragment.
    Exec {
        #[arg(long)]
        lang: Option<String>,
        /// Timeout in seconds (default from config).
        #[arg(long)]
        timeout: Option<u64>,
        /// Input file, or `-` for stdin.
        #[arg(default_value = "-")]
        input: PathBuf,
    },
    /// Execute the first code block, asking the model for fixes on failure.
    Run {
        /// The original request, quoted in fix prompts.
        #[arg(long)]
        goal: String,
        #[arg(long)]
        lang: Option<String>,
        #[arg(long)]
        max_attempts: Option<u32>,
        /// First-attempt timeout in seconds.
        #[arg(long)]
        base_timeout: Option<u64>,
        /// Model command reading the prompt on stdin (overrides config), e.g. "claude -p".
        #[arg(long)]
        fix_command: Option<String>,
        input: PathBuf,
    },
    /// Serve an HTML document from a detached server.
    Deploy {
        input: PathBuf,
        /// Use the dynamic backend instead of a static file server.
        #[arg(long)]
        backend: bool,
        /// Provision the starter SQLite database.
        #[arg(long)]
        database: bool,
    },
    /// Print the code blocks in the input as JSON lines.
    Extract { input: PathBuf },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let config = load_config(&cli.config)?;
    match cli.command {
        Command::Exec {
            lang,
            timeout,
            input,
        } => cmd_exec(&config, lang.as_deref(), timeout, &input),
        Command::Run {
            goal,
            lang,
            max_attempts,
            base_timeout,
            fix_command,
            input,
        } => cmd_run(
            &config,
            RunArgs {
                goal,
                lang,
                max_attempts,
                base_timeout,
                fix_command,
            },
            &input,
        ),
        Command::Deploy {
            input,
            backend,
            database,
        } => cmd_deploy(&config, &input, backend, database),
        Command::Extract { input } => cmd_extract(&input),
    }
}

struct Engine {
    dispatcher: LanguageDispatcher,
    deployments: Arc<DeploymentManager>,
}

fn build_engine(config: &EngineConfig) -> Result<Engine> {
    let env = minimal_env(&config.execution.env_passthrough, &config.execution.env_defaults);
    let deployments = Arc::new(DeploymentManager::for_host(&config.deploy, env.clone())?);
    let bridge = Arc::new(AdbBridge::new(
        &config.device,
        env.clone(),
        config.execution.output_limit_bytes,
    ));
    let dispatcher = LanguageDispatcher::from_config(config, env, Arc::clone(&deployments), bridge);
    Ok(Engine {
        dispatcher,
        deployments,
    })
}

fn cmd_exec(config: &EngineConfig, lang: Option<&str>, timeout: Option<u64>, input: &Path) -> Result<i32> {
    let fragments = read_fragments(input, lang)?;
    let timeout = timeout.map_or_else(|| config.execution.default_timeout(), Duration::from_secs);
    let engine = build_engine(config)?;

    let mut all_ok = true;
    for fragment in &fragments {
        let result = engine.dispatcher.execute(fragment, timeout)?;
        print_result(&result);
        all_ok &= result.success;
    }
    report_servers(&engine);
    Ok(if all_ok { exit_codes::OK } else { exit_codes::FAILED })
}

struct RunArgs {
    goal: String,
    lang: Option<String>,
    max_attempts: Option<u32>,
    base_timeout: Option<u64>,
    fix_command: Option<String>,
}

fn cmd_run(config: &EngineConfig, args: RunArgs, input: &Path) -> Result<i32> {
    let fragment = read_fragments(input, args.lang.as_deref())?
        .into_iter()
        .next()
        .context("no code block to run")?;
    let engine = build_engine(config)?;

    let env = minimal_env(&config.execution.env_passthrough, &config.execution.env_defaults);
    let mut retry = config.retry.clone();
    if let Some(command) = args.fix_command {
        retry.fix_command = command.split_whitespace().map(String::from).collect();
    }
    let client = CommandClient::from_config(&retry, env, config.execution.output_limit_bytes)?;

    let request = RetryRequest {
        goal: args.goal,
        fragment,
        max_attempts: args.max_attempts.unwrap_or(retry.max_attempts),
        base_timeout: args
            .base_timeout
            .map_or_else(|| retry.base_timeout(), Duration::from_secs),
    };
    let orchestrator = RetryOrchestrator::new(&engine.dispatcher, RetrySettings::from_config(&retry));
    let session = orchestrator.run(&request, &client)?;

    print_result(&session.final_result);
    let attempts = session.attempts.len();
    match &session.stop {
        RetryStop::Succeeded { recovered: true } => eprintln!("recovered after {attempts} attempts"),
        RetryStop::Succeeded { recovered: false } => {}
        RetryStop::AttemptsExhausted => eprintln!("failed after {attempts} attempts"),
        RetryStop::FixUnavailable { reason } => eprintln!("no fix available: {reason}"),
        RetryStop::NoMatchingFix => eprintln!("model reply had no {} code block", request.fragment.language),
        RetryStop::RepeatedCode => eprintln!("model repeated code that already failed"),
        RetryStop::Infrastructure { reason } => eprintln!("attempt could not run: {reason}"),
    }
    if let Some(path) = &session.history_path {
        eprintln!("error history: {}", path.display());
    }
    report_servers(&engine);
    Ok(if session.succeeded() {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

fn cmd_deploy(config: &EngineConfig, input: &Path, backend: bool, database: bool) -> Result<i32> {
    let html = read_input(input)?;
    let env = minimal_env(&config.execution.env_passthrough, &config.execution.env_defaults);
    let deployments = DeploymentManager::for_host(&config.deploy, env)?;
    let content = DeployContent::document(html)
        .with_backend(backend)
        .with_database(database);
    match deployments.deploy(&content)? {
        LaunchOutcome::Serving {
            deployment,
            responding,
        } => {
            println!("url: {}", deployment.url());
            println!("pid: {}", deployment.process_id);
            println!("dir: {}", deployment.directory.display());
            println!("id: {}", deployment.id);
            if !responding {
                eprintln!("server is running but did not answer HTTP probes yet");
            }
            Ok(exit_codes::OK)
        }
        LaunchOutcome::Exited {
            port,
            exit_code,
            log,
        } => {
            eprintln!("server on port {port} exited with {exit_code}:\n{log}");
            Ok(exit_codes::FAILED)
        }
    }
}

fn cmd_extract(input: &Path) -> Result<i32> {
    let text = read_input(input)?;
    for fragment in extract_fragments(&text) {
        println!("{}", serde_json::to_string(&fragment).context("serialize fragment")?);
    }
    Ok(exit_codes::OK)
}

fn read_input(input: &Path) -> Result<String> {
    if input == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read stdin")?;
        return Ok(buf);
    }
    fs::read_to_string(input).with_context(|| format!("read {}", input.display()))
}

fn read_fragments(input: &Path, lang: Option<&str>) -> Result<Vec<CodeFragment>> {
    let text = read_input(input)?;
    if let Some(tag) = lang {
        return Ok(vec![CodeFragment::new(Language::from_tag(tag), text)]);
    }
    let fragments = extract_fragments(&text);
    if fragments.is_empty() {
        bail!("no fenced code blocks in {} (use --lang for raw source)", input.display());
    }
    Ok(fragments)
}

fn print_result(result: &ExecutionResult) {
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    let status = match result.failure {
        None => "ok".to_string(),
        Some(kind) => format!("{} (exit {})", kind.as_str(), result.exit_code),
    };
    eprintln!(
        "[{}] {} in {:.2}s",
        result.language,
        status,
        result.duration.as_secs_f64()
    );
}

/// Servers keep running after exit; say where they are.
fn report_servers(engine: &Engine) {
    for deployment in engine.deployments.list() {
        eprintln!(
            "server {} still running at {} (pid {})",
            deployment.id,
            deployment.url(),
            deployment.process_id
        );
    }
}
