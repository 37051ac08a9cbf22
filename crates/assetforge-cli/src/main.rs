use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use assetforge_core::{load_dotenv, Config};
use assetforge_dbt::{DbtCliClient, DbtCliLine, DbtMultiAsset, Manifest};
use assetforge_instance::{Instance, InstanceError, RunRecord, RunStatus, SlotCounts, DAGSTER_HOME_ENV};
use assetforge_warehouse::{ConnectionSpec, QueryResult, SnowflakeResource};

/// assetforge - dbt assets, instance administration and Snowflake resources
#[derive(Parser)]
#[command(name = "assetforge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: assetforge.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and maintain the instance rooted at $DAGSTER_HOME
    Instance {
        #[command(subcommand)]
        command: InstanceCommands,
    },

    /// List and run the dbt project's assets
    Assets {
        #[command(subcommand)]
        command: AssetsCommands,
    },

    /// Check and use the [warehouse] resource
    Warehouse {
        #[command(subcommand)]
        command: WarehouseCommands,
    },
}

#[derive(Subcommand)]
enum InstanceCommands {
    /// List the information about the current instance
    Info,

    /// Automatically migrate an out of date instance
    Migrate,

    /// Rebuild index over historical runs for performance
    Reindex,

    /// Commands for working with the instance-wide op concurrency limits
    Concurrency {
        #[command(subcommand)]
        command: ConcurrencyCommands,
    },
}

#[derive(Subcommand)]
enum ConcurrencyCommands {
    /// Get op concurrency limits
    Get {
        /// Concurrency key to show
        key: Option<String>,

        /// Show all concurrency limits
        #[arg(long)]
        all: bool,
    },

    /// Set op concurrency limits
    Set {
        /// Concurrency key
        key: String,

        /// Number of slots
        limit: usize,
    },
}

#[derive(Args)]
struct SelectionArgs {
    /// Path to dbt manifest.json (default: [dbt].manifest)
    #[arg(short = 'f', long)]
    manifest: Option<PathBuf>,

    /// dbt selection (default: [dbt].select)
    #[arg(short, long)]
    select: Option<String>,

    /// dbt exclusion (default: [dbt].exclude)
    #[arg(short = 'x', long)]
    exclude: Option<String>,
}

#[derive(Subcommand)]
enum AssetsCommands {
    /// Show the outputs of the selection and their dependencies
    List {
        #[command(flatten)]
        selection: SelectionArgs,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Materialize outputs by invoking dbt
    Run {
        #[command(flatten)]
        selection: SelectionArgs,

        /// Output names to materialize (default: all)
        #[arg(short, long = "output")]
        outputs: Vec<String>,

        /// dbt sub-command to run
        #[arg(long = "dbt-command", default_value = "build")]
        dbt_command: String,
    },
}

#[derive(Subcommand)]
enum WarehouseCommands {
    /// Validate the [warehouse] section and print connection arguments
    Check,

    /// Run one SQL statement
    Query {
        sql: String,

        /// Print the rows the statement returns
        #[arg(long)]
        fetch: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Some(path) = load_dotenv() {
        tracing::debug!(path = %path.display(), "Loaded .env");
    }

    let config = Config::discover(cli.config.as_deref())?;
    if cli.verbose && cli.config.is_none() && config.project_root.join("assetforge.toml").exists() {
        eprintln!("{} assetforge.toml", "Using".cyan());
    }

    match cli.command {
        Commands::Instance { command } => {
            let home = std::env::var(DAGSTER_HOME_ENV)
                .ok()
                .filter(|home| !home.is_empty());
            let instance = Instance::from_home(home.as_ref().map(PathBuf::from))?;
            let mut stdout = std::io::stdout().lock();
            instance_command(&instance, home.as_deref(), command, &mut stdout)
        }
        Commands::Assets { command } => assets_command(&config, command, cli.verbose),
        Commands::Warehouse { command } => warehouse_command(&config, command).await,
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

// =============================================================================
// instance
// =============================================================================

fn instance_command(
    instance: &Instance,
    home: Option<&str>,
    command: InstanceCommands,
    out: &mut dyn Write,
) -> Result<()> {
    match command {
        InstanceCommands::Info => instance_info(instance, home, out),
        InstanceCommands::Migrate => instance_migrate(instance, out),
        InstanceCommands::Reindex => instance_reindex(instance, out),
        InstanceCommands::Concurrency {
            command: ConcurrencyCommands::Get { key, all },
        } => concurrency_get(instance, key.as_deref(), all, out),
        InstanceCommands::Concurrency {
            command: ConcurrencyCommands::Set { key, limit },
        } => concurrency_set(instance, &key, limit, out),
    }
}

fn home_display(instance: &Instance) -> String {
    instance
        .home()
        .map(|home| home.display().to_string())
        .unwrap_or_default()
}

/// Run an instance operation that reports progress line by line
fn with_printer<F>(out: &mut dyn Write, run: F) -> Result<()>
where
    F: FnOnce(&mut dyn FnMut(&str)) -> Result<(), InstanceError>,
{
    let mut write_error = None;
    let mut print = |line: &str| {
        if write_error.is_none() {
            write_error = writeln!(out, "{}", line).err();
        }
    };
    run(&mut print)?;

    match write_error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn instance_info(instance: &Instance, home: Option<&str>, out: &mut dyn Write) -> Result<()> {
    if instance.is_ephemeral() {
        if let Some(home) = home {
            bail!(
                "Unexpected state, ephemeral instance but DAGSTER_HOME is set to \"{}\"",
                home
            );
        }
        writeln!(
            out,
            "$DAGSTER_HOME is not set, using an ephemeral instance. Run artifacts will only exist \
             in memory and any filesystem access will use a temp directory that gets cleaned up \
             on exit."
        )?;
        return Ok(());
    }

    writeln!(out, "$DAGSTER_HOME: {}\n", home_display(instance))?;
    writeln!(out, "\nInstance configuration:\n-----------------------")?;
    writeln!(out, "{}", instance.info_str()?)?;
    writeln!(out, "\nStorage schema state:\n---------------------")?;
    writeln!(out, "{}", instance.schema_str()?)?;
    Ok(())
}

fn instance_migrate(instance: &Instance, out: &mut dyn Write) -> Result<()> {
    if instance.is_ephemeral() {
        eprintln!(
            "{}",
            "$DAGSTER_HOME is not set; ephemeral instances do not need to be migrated.".yellow()
        );
    }

    writeln!(out, "$DAGSTER_HOME: {}\n", home_display(instance))?;
    with_printer(out, |print| instance.upgrade(print))?;
    writeln!(out, "{}", instance.info_str()?)?;
    Ok(())
}

fn instance_reindex(instance: &Instance, out: &mut dyn Write) -> Result<()> {
    if instance.is_ephemeral() {
        writeln!(
            out,
            "$DAGSTER_HOME is not set; ephemeral instances cannot be reindexed.  If you intended \
             to migrate a persistent instance, please ensure that $DAGSTER_HOME is set accordingly."
        )?;
        return Ok(());
    }

    writeln!(out, "$DAGSTER_HOME: {}\n", home_display(instance))?;
    with_printer(out, |print| instance.reindex(print))
}

fn slot_line(instance: &Instance, key: &str) -> Result<String> {
    let counts = SlotCounts::of(&instance.concurrency_info(key)?);
    Ok(format!(
        "\"{}\": {} / {} slots occupied",
        key, counts.claimed, counts.total
    ))
}

fn concurrency_get(
    instance: &Instance,
    key: Option<&str>,
    all: bool,
    out: &mut dyn Write,
) -> Result<()> {
    if all {
        let keys = instance.concurrency_limited_keys()?;
        if keys.is_empty() {
            writeln!(
                out,
                "No concurrency limits set. Run `assetforge instance concurrency set <key> <limit>` \
                 to set limits."
            )?;
            return Ok(());
        }

        writeln!(out, "Concurrency limits:")?;
        for key in &keys {
            writeln!(out, "{}", slot_line(instance, key)?)?;
        }
        return Ok(());
    }

    match key {
        Some(key) => {
            writeln!(out, "{}", slot_line(instance, key)?)?;
            Ok(())
        }
        None => bail!(
            "Must either specify a key argument or the `--all` option. Run `assetforge instance \
             concurrency get --help` for more info."
        ),
    }
}

fn concurrency_set(instance: &Instance, key: &str, limit: usize, out: &mut dyn Write) -> Result<()> {
    instance.allocate_concurrency_slots(key, limit)?;
    instance.flush()?;
    writeln!(out, "Set concurrency limit for {} to {}.", key, limit)?;
    Ok(())
}

// =============================================================================
// assets
// =============================================================================

fn assets_command(config: &Config, command: AssetsCommands, verbose: bool) -> Result<()> {
    match command {
        AssetsCommands::List { selection, json } => {
            let asset = load_multi_asset(config, &selection, verbose)?;
            let mut stdout = std::io::stdout().lock();
            if json {
                writeln!(stdout, "{}", serde_json::to_string_pretty(&asset_summary(&asset))?)?;
                Ok(())
            } else {
                print_asset_listing(&asset, &mut stdout)
            }
        }
        AssetsCommands::Run {
            selection,
            outputs,
            dbt_command,
        } => {
            let asset = load_multi_asset(config, &selection, verbose)?;
            assets_run(config, &asset, outputs, &dbt_command, verbose)
        }
    }
}

fn load_multi_asset(config: &Config, selection: &SelectionArgs, verbose: bool) -> Result<DbtMultiAsset> {
    let manifest_path = selection
        .manifest
        .clone()
        .unwrap_or_else(|| config.dbt.manifest_path(&config.project_root));

    if !manifest_path.exists() {
        bail!(
            "Manifest not found at {}. Run 'dbt compile' or 'dbt build' first.",
            manifest_path.display()
        );
    }

    if verbose {
        eprintln!("{} {}", "Loading manifest from:".cyan(), manifest_path.display());
    }
    let manifest = Manifest::from_file(&manifest_path)?;

    let select = selection.select.as_deref().unwrap_or(&config.dbt.select);
    let exclude = selection.exclude.as_deref().or(config.dbt.exclude.as_deref());
    Ok(DbtMultiAsset::new(&manifest, select, exclude)?)
}

fn asset_summary(asset: &DbtMultiAsset) -> Value {
    serde_json::json!({
        "select": asset.select(),
        "exclude": asset.exclude(),
        "compute_kind": asset.compute_kind(),
        "outs": asset.outs(),
        "internal_asset_deps": asset.internal_asset_deps(),
        "non_argument_deps": asset.non_argument_deps(),
    })
}

fn print_asset_listing(asset: &DbtMultiAsset, out: &mut dyn Write) -> Result<()> {
    writeln!(
        out,
        "{} {} outputs (select: {}, exclude: {})",
        "dbt assets:".bold(),
        asset.outs().len(),
        asset.select(),
        asset.exclude().unwrap_or("-")
    )?;

    for (name, out_def) in asset.outs() {
        writeln!(out, "  {} [{}] {}", name.green(), out_def.resource_type, out_def.asset_key)?;
        let deps = asset
            .internal_asset_deps()
            .get(name)
            .map(|deps| deps.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        if !deps.is_empty() {
            writeln!(out, "      depends on: {}", deps.join(", "))?;
        }
    }

    if !asset.non_argument_deps().is_empty() {
        writeln!(out, "{}", "Upstream inputs:".bold())?;
        for key in asset.non_argument_deps() {
            writeln!(out, "  {}", key)?;
        }
    }

    Ok(())
}

fn new_run_id() -> String {
    format!(
        "{}-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S%3f"),
        std::process::id()
    )
}

fn assets_run(
    config: &Config,
    asset: &DbtMultiAsset,
    outputs: Vec<String>,
    dbt_command: &str,
    verbose: bool,
) -> Result<()> {
    let requested: BTreeSet<String> = if outputs.is_empty() {
        asset.output_names()
    } else {
        outputs.into_iter().collect()
    };
    let invocation = asset.invocation(dbt_command, &requested)?;
    let client = DbtCliClient::from_config(&config.dbt, &config.project_root);

    let instance = Instance::from_env()?;
    let run_id = new_run_id();
    instance.add_run(RunRecord::new(&run_id, "dbt_assets"))?;
    instance.update_run_status(&run_id, RunStatus::Started)?;

    println!(
        "{} {}",
        "Running".cyan(),
        client.command_line(&invocation).join(" ")
    );

    let result = client.stream_json_with(&invocation, |line| match line {
        DbtCliLine::Event(event) if event.level == "error" => {
            eprintln!("{}", event.message.red())
        }
        DbtCliLine::Event(event) if event.level != "debug" || verbose => {
            println!("{}", event.message)
        }
        DbtCliLine::Raw(raw) if verbose => println!("{}", raw),
        _ => {}
    });

    match result {
        Ok(output) => {
            instance.update_run_status(&run_id, RunStatus::Success)?;
            let materialized = asset.output_names_for(&output.materialized_unique_ids());
            println!();
            println!(
                "{} {} of {} requested outputs materialized (run {})",
                "✓".green(),
                materialized.len(),
                requested.len(),
                run_id
            );
            for name in &materialized {
                println!("  {}", name);
            }
            Ok(())
        }
        Err(err) => {
            instance.update_run_status(&run_id, RunStatus::Failure)?;
            Err(anyhow!("{} (run {})", err, run_id))
        }
    }
}

// =============================================================================
// warehouse
// =============================================================================

fn warehouse_resource(config: &Config) -> Result<SnowflakeResource> {
    let warehouse = config.warehouse.as_ref().ok_or_else(|| {
        anyhow!(
            "No warehouse configuration found in assetforge.toml. \
             Add a [warehouse] section with type and connection settings."
        )
    })?;
    Ok(SnowflakeResource::from_warehouse_config(warehouse)?)
}

async fn warehouse_command(config: &Config, command: WarehouseCommands) -> Result<()> {
    let resource = warehouse_resource(config)?;
    let mut stdout = std::io::stdout().lock();

    match command {
        WarehouseCommands::Check => print_connection_check(&resource, &mut stdout),
        WarehouseCommands::Query { sql, fetch } => {
            let result = resource.execute_query(&sql, None, fetch, fetch).await?;
            print_query_result(result.as_ref(), &mut stdout)
        }
    }
}

fn print_connection_check(resource: &SnowflakeResource, out: &mut dyn Write) -> Result<()> {
    let spec = resource.connection_spec()?;
    let config = resource.config();

    writeln!(out, "{} Snowflake configuration is valid", "✓".green())?;
    writeln!(out, "  connector: {}", spec.kind())?;
    writeln!(out, "  paramstyle: {}", config.paramstyle.as_str())?;
    writeln!(out, "  auth: {:?}", config.auth)?;
    writeln!(out, "{}", "Connection arguments:".bold())?;
    for (key, value) in spec.redacted() {
        writeln!(out, "  {} = {}", key, value)?;
    }
    if let ConnectionSpec::SqlAlchemy(sqlalchemy) = &spec {
        writeln!(out, "  url = {}", sqlalchemy)?;
    }
    if spec.private_key().is_some() {
        writeln!(out, "  private_key = <loaded>")?;
    }
    Ok(())
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn print_query_result(result: Option<&QueryResult>, out: &mut dyn Write) -> Result<()> {
    let Some(result) = result else {
        writeln!(out, "{}", "Query executed.".green())?;
        return Ok(());
    };

    if let QueryResult::Table(table) = result {
        if !table.columns.is_empty() {
            writeln!(out, "{}", table.columns.join("\t").bold())?;
        }
    }
    for row in result.rows() {
        let cells: Vec<String> = row.iter().map(render_cell).collect();
        writeln!(out, "{}", cells.join("\t"))?;
    }
    Ok(())
}
