use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gadget_composer::config::ComposerConfig;
use gadget_composer::gadget::{
    remove_gadget, BuildError, BuildOptions, BuildResult, ComposedGadget, ConfigFsStore,
    GadgetBuilder, GadgetStore, MemoryStore, StoreOp, UnwindPolicy, UnwindReport,
};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// gadget-composer command line arguments
#[derive(Parser, Debug)]
#[command(name = "gadget-composer")]
#[command(version, about = "Compose USB gadgets in configfs with ordered creation and unwind", long_about = None)]
struct CliArgs {
    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a gadget tree (without activating it)
    Create(CreateArgs),
    /// Tear down an existing gadget tree
    Remove(RemoveArgs),
    /// Print the built-in configuration as TOML
    DefaultConfig,
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// Gadget description file (TOML); built-in iAP2 / NCM gadget if omitted
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// configfs mount point (overrides env and config file)
    #[arg(short = 'r', long, value_name = "DIR")]
    store_root: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct CreateArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Build against an in-memory store and print the operations
    #[arg(long)]
    dry_run: bool,

    /// Dismantle the tree again after a successful build
    #[arg(long)]
    verify: bool,

    /// Overall build timeout in milliseconds (overrides config file)
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Stop unwinding at the first removal failure
    #[arg(long)]
    fail_fast: bool,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct RemoveArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Gadget name (defaults to the one in the config)
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Stop at the first removal failure
    #[arg(long)]
    fail_fast: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

/// Everything `create` reports
#[derive(Serialize)]
struct CreateOutput<'a> {
    dry_run: bool,
    result: &'a BuildResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    operations: Option<&'a [StoreOp]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    verify: Option<&'a UnwindReport>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose, args.log_json);

    match args.command {
        Command::Create(create) => run_create(create).await,
        Command::Remove(remove) => run_remove(remove).await,
        Command::DefaultConfig => {
            print!("{}", ComposerConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ComposerConfig> {
    match path {
        Some(path) => Ok(ComposerConfig::load(path)?),
        None => {
            tracing::debug!("No config file given, using built-in gadget");
            Ok(ComposerConfig::default())
        }
    }
}

fn policy(fail_fast: bool, config: &ComposerConfig) -> UnwindPolicy {
    if fail_fast {
        UnwindPolicy::FailFast
    } else {
        config.unwind_policy
    }
}

async fn run_create(args: CreateArgs) -> anyhow::Result<()> {
    let config = load_config(args.store.config.as_deref())?;
    let root = config.resolve_store_root(args.store.store_root.as_deref());
    let plan = config.to_plan().context("Invalid gadget description")?;

    let options = BuildOptions {
        deadline: args.timeout_ms.or(config.timeout_ms).map(Duration::from_millis),
        unwind_policy: policy(args.fail_fast, &config),
        udc_class_path: PathBuf::from(&config.udc_class_path),
    };
    let builder = GadgetBuilder::with_options(plan, options);

    tracing::info!("Starting gadget-composer v{}", env!("CARGO_PKG_VERSION"));

    if args.dry_run {
        let composed = builder
            .build_async::<MemoryStore>(root)
            .await
            .map_err(|e| report_failure(e, args.json))?;
        let (store, result, verify) = finish(composed, args.verify);
        print_create(true, &result, Some(store.ops()), verify.as_ref(), args.json)?;
    } else {
        let composed = builder
            .build_async::<ConfigFsStore>(root)
            .await
            .map_err(|e| report_failure(e, args.json))?;
        let (_store, result, verify) = finish(composed, args.verify);
        print_create(false, &result, None, verify.as_ref(), args.json)?;
        if let Some(report) = &verify {
            if !report.fully_clean {
                anyhow::bail!("Verification teardown left residual entities");
            }
        }
    }
    Ok(())
}

/// Release the built tree, or dismantle it again when verifying
fn finish<S: GadgetStore>(
    composed: ComposedGadget<S>,
    verify: bool,
) -> (S, BuildResult, Option<UnwindReport>) {
    if verify {
        let result = composed.result().clone();
        let (store, report) = composed.dismantle();
        report.log_residuals();
        (store, result, Some(report))
    } else {
        let (store, _registry, result) = composed.into_parts();
        (store, result, None)
    }
}

fn print_create(
    dry_run: bool,
    result: &BuildResult,
    operations: Option<&[StoreOp]>,
    verify: Option<&UnwindReport>,
    json: bool,
) -> anyhow::Result<()> {
    if json {
        let output = CreateOutput {
            dry_run,
            result,
            operations,
            verify,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if let Some(ops) = operations {
        println!("Operations:");
        for op in ops {
            println!("  {}", op);
        }
    }

    println!("Gadget {} composed at {}", result.gadget.name, result.gadget.path.display());
    println!(
        "  {} function(s), {} config(s), {} binding(s)",
        result.functions.len(),
        result.configs.len(),
        result.bindings.len()
    );

    match verify {
        Some(report) => println!(
            "Verification teardown: {} removed, {}",
            report.removed.len(),
            if report.fully_clean { "clean" } else { "residual entities left" }
        ),
        None => {
            println!("Next steps:");
            for step in &result.guidance {
                println!("  - {}", step);
            }
        }
    }
    Ok(())
}

/// Log a failed build and turn it into the process error
fn report_failure(error: BuildError, json: bool) -> anyhow::Error {
    tracing::error!("{}", error);
    error.unwind.log_residuals();

    if json {
        let output = serde_json::json!({
            "error": error.source.to_string(),
            "kind": error.source.kind_name(),
            "step": error.step.to_string(),
            "reached": error.reached,
            "unwind": error.unwind,
        });
        match serde_json::to_string_pretty(&output) {
            Ok(text) => println!("{}", text),
            Err(e) => tracing::warn!("Failed to render JSON error: {}", e),
        }
    } else if !error.unwind.fully_clean {
        eprintln!(
            "Unwind incomplete: {} entities could not be removed",
            error.unwind.residual_errors.len()
        );
    }

    anyhow::Error::new(error)
}

async fn run_remove(args: RemoveArgs) -> anyhow::Result<()> {
    let config = load_config(args.store.config.as_deref())?;
    let root = config.resolve_store_root(args.store.store_root.as_deref());
    let name = args.name.unwrap_or_else(|| config.gadget.name.clone());
    let unwind_policy = policy(args.fail_fast, &config);

    let report = tokio::task::spawn_blocking(move || -> gadget_composer::Result<UnwindReport> {
        let mut store = ConfigFsStore::initialize(&root)?;
        remove_gadget(&mut store, &name, unwind_policy)
    })
    .await
    .context("Remove task failed")??;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Removed {} entities{}",
            report.removed.len(),
            if report.fully_clean { "" } else { ", some remain" }
        );
    }

    if !report.fully_clean {
        anyhow::bail!("Gadget teardown left residual entities");
    }
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "gadget_composer=error",
        LogLevel::Warn => "gadget_composer=warn",
        LogLevel::Info => "gadget_composer=info",
        LogLevel::Verbose | LogLevel::Debug => "gadget_composer=debug",
        LogLevel::Trace => "gadget_composer=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    // Logs go to stderr so stdout stays parseable with --json
    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
