use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::to_writer_pretty;
use spaceflights::graph::Edge;
use spaceflights::lockfile::generate_lock;
use spaceflights::observability::log_snapshot;
#[cfg(feature = "metrics-server")]
use spaceflights::observability::server::MetricsServer;
use spaceflights::pipeline::{StepStatus, build_graph, build_pipeline};
use spaceflights::presets::generate_preset;
use spaceflights::recipe::Recipe;
use spaceflights::scheduler::SchedulePolicy;
use spaceflights::steps::default_registry;
use spaceflights::validation::validate_recipe;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let otlp_endpoint_for_tracing = match &cli.command {
        Commands::Run { otlp_endpoint, .. } => otlp_endpoint.clone(),
        _ => None,
    };

    configure_tracing(otlp_endpoint_for_tracing.as_deref())?;

    let command_result = match cli.command {
        Commands::Run {
            recipe,
            dry_run,
            schedule,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            metrics_listen,
            otlp_endpoint: _,
            report,
        } => run_recipe(RunOptions {
            recipe_path: recipe,
            dry_run,
            schedule,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            metrics_listen,
            report,
        }),
        Commands::Graph { recipe, json } => show_graph(&recipe, json),
        Commands::ListSteps => {
            list_steps();
            Ok(())
        }
        Commands::Validate { recipe } => validate_recipe_cmd(recipe),
        Commands::Lock { recipe, output } => lock_recipe(recipe, output),
        Commands::Recipe { action } => recipe_command(action),
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        spaceflights::observability::otel::shutdown();
    }

    command_result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                spaceflights::observability::otel::install_tracer("spaceflights", endpoint)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
            return Ok(());
        }
    }

    #[cfg(not(feature = "otel"))]
    if let Some(endpoint) = otlp_endpoint {
        eprintln!(
            "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
            endpoint
        );
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;

    Ok(())
}

struct RunOptions {
    recipe_path: PathBuf,
    dry_run: bool,
    schedule: SchedulePolicy,
    print_metrics: bool,
    metrics_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
    metrics_listen: Option<String>,
    report: Option<PathBuf>,
}

fn run_recipe(options: RunOptions) -> Result<()> {
    let recipe = Recipe::load(&options.recipe_path)?;
    let registry = default_registry();

    if options.dry_run {
        let parameters = recipe.parameters.resolve()?;
        let graph = build_graph(&registry, &recipe.name, recipe.inputs.keys(), &recipe.steps)?;
        info!(
            pipeline = %recipe.name,
            steps = graph.len(),
            features = parameters.features.len(),
            "Dry run: pipeline resolved"
        );
        for (idx, step) in graph.execution_order().iter().enumerate() {
            println!("{:>2}. {step}", idx + 1);
        }
        return Ok(());
    }

    let executor = build_pipeline(&registry, &recipe, options.schedule)?;
    let metrics_handle = executor.metrics();

    #[cfg(feature = "metrics-server")]
    let metrics_server = if let Some(addr_str) = &options.metrics_listen {
        let addr: SocketAddr = addr_str
            .parse()
            .with_context(|| format!("Invalid metrics listen address: {addr_str}"))?;
        Some(MetricsServer::start(addr, metrics_handle.clone())?)
    } else {
        None
    };

    #[cfg(not(feature = "metrics-server"))]
    if let Some(addr_str) = &options.metrics_listen {
        warn!(
            "Metrics server feature not enabled; ignoring --metrics-listen={}.",
            addr_str
        );
    }

    let report = executor.execute(&recipe.inputs)?;

    for step in &report.steps {
        match &step.status {
            StepStatus::Succeeded => {}
            StepStatus::Failed { error } => {
                error!(step = %step.step, "{error}");
            }
            StepStatus::Skipped { blocked_by } => {
                warn!(step = %step.step, blocked_by = %blocked_by, "Step skipped");
            }
        }
    }
    for (artifact, metrics) in &report.model_metrics {
        if let Some(r2) = metrics.r2 {
            println!("{artifact}: r2={r2:.3}");
        }
    }
    for endpoint in &report.endpoints {
        println!("deployed {} at {}", endpoint.key, endpoint.url);
    }

    if let Some(path) = &options.report {
        write_json(path, &report)?;
        info!(report = %path.display(), "Run report written");
    }

    if options.print_metrics || options.metrics_json.is_some() || options.metrics_prometheus.is_some()
    {
        let snapshot = metrics_handle.snapshot();
        if options.print_metrics {
            log_snapshot(&snapshot);
        }
        if let Some(path) = &options.metrics_json {
            write_json(path, &snapshot)?;
            info!(metrics = %path.display(), "Metrics JSON written");
        }
        if let Some(path) = &options.metrics_prometheus {
            ensure_parent(path)?;
            fs::write(path, snapshot.to_prometheus()).with_context(|| {
                format!("Failed to write Prometheus metrics: {}", path.display())
            })?;
            info!(metrics = %path.display(), "Prometheus metrics written");
        }
    }

    #[cfg(feature = "metrics-server")]
    if let Some(mut server) = metrics_server {
        server.stop();
    }

    let failed = report.failed_steps();
    if !failed.is_empty() {
        bail!(
            "Pipeline '{}' finished with {} failed step(s): {}",
            report.pipeline,
            failed.len(),
            failed.join(", ")
        );
    }
    info!(pipeline = %report.pipeline, duration_ms = report.duration_ms, "Pipeline completed");
    Ok(())
}

#[derive(Serialize)]
struct GraphView<'a> {
    pipeline: &'a str,
    externals: Vec<&'a str>,
    execution_order: Vec<&'a str>,
    levels: Vec<Vec<&'a str>>,
    edges: Vec<Edge>,
}

fn show_graph(recipe_path: &Path, json: bool) -> Result<()> {
    let recipe = Recipe::load(recipe_path)?;
    let registry = default_registry();
    let graph = build_graph(&registry, &recipe.name, recipe.inputs.keys(), &recipe.steps)?;

    let view = GraphView {
        pipeline: graph.name(),
        externals: graph.externals().iter().map(String::as_str).collect(),
        execution_order: graph.execution_order(),
        levels: graph.levels(),
        edges: graph.edges(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!("Pipeline '{}' ({} steps)", view.pipeline, graph.len());
    println!("External inputs: {}", view.externals.join(", "));
    println!("Execution order:");
    for (idx, step) in graph.ordered_steps().enumerate() {
        println!("  {:>2}. {} ({})", idx + 1, step.name, step.handler());
    }
    println!("Levels:");
    for (idx, level) in view.levels.iter().enumerate() {
        println!("  {idx}: {}", level.join(", "));
    }
    println!("Edges:");
    for edge in &view.edges {
        println!("  {} -> {} [{}]", edge.from, edge.to, edge.artifact);
    }
    Ok(())
}

fn list_steps() {
    let registry = default_registry();
    println!("Available steps:");
    for name in registry.known_steps() {
        if let Ok(step) = registry.create(&name, Default::default()) {
            println!(
                "- {name} ({}) -> ({})",
                step.inputs().join(", "),
                step.outputs().join(", ")
            );
        }
    }
}

fn validate_recipe_cmd(recipe_path: PathBuf) -> Result<()> {
    let recipe = Recipe::load(&recipe_path)?;
    let registry = default_registry();
    let report = validate_recipe(&recipe, &registry);

    for warning in &report.warnings {
        warn!(file = %recipe_path.display(), "{warning}");
    }

    if report.is_ok() {
        info!(file = %recipe_path.display(), "Recipe validation passed");
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %recipe_path.display(), "{error_msg}");
        }
        Err(anyhow!(
            "Recipe validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn lock_recipe(recipe_path: PathBuf, output_path: PathBuf) -> Result<()> {
    let recipe = Recipe::load(&recipe_path)?;
    let registry = default_registry();
    let report = validate_recipe(&recipe, &registry);

    for warning in &report.warnings {
        warn!(file = %recipe_path.display(), "{warning}");
    }

    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %recipe_path.display(), "{error_msg}");
        }
        return Err(anyhow!(
            "Cannot generate lockfile due to {} validation error(s)",
            report.errors.len()
        ));
    }

    ensure_parent(&output_path)?;
    let lock = generate_lock(&recipe, &registry, &output_path)?;
    info!(
        lockfile = %output_path.display(),
        steps = lock.steps.len(),
        "Lockfile generated successfully"
    );

    Ok(())
}

fn recipe_command(command: RecipeCommands) -> Result<()> {
    match command {
        RecipeCommands::New { preset, output } => {
            let destination =
                output.unwrap_or_else(|| PathBuf::from(format!("recipes/{preset}.yaml")));
            let generated = generate_preset(&preset, &destination)?;
            info!(
                preset = %preset,
                path = %generated.display(),
                "Preset recipe generated"
            );
            Ok(())
        }
        RecipeCommands::Lint { recipes } => lint_recipes(&recipes),
        RecipeCommands::Diff { lhs, rhs } => diff_recipes(&lhs, &rhs),
    }
}

/// Expand glob patterns; a pattern matching nothing is kept as a literal path.
fn expand_recipe_patterns(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for pattern in patterns {
        let matches = glob::glob(pattern)
            .with_context(|| format!("Invalid glob pattern: {pattern}"))?
            .collect::<Result<Vec<_>, _>>()?;
        if matches.is_empty() {
            paths.push(PathBuf::from(pattern));
        } else {
            paths.extend(matches);
        }
    }
    Ok(paths)
}

fn lint_recipes(patterns: &[String]) -> Result<()> {
    let recipes = expand_recipe_patterns(patterns)?;
    if recipes.is_empty() {
        bail!("No recipe files supplied for linting");
    }

    let registry = default_registry();
    let mut failures = 0usize;

    for recipe_path in &recipes {
        match Recipe::load(recipe_path) {
            Ok(recipe) => {
                let report = validate_recipe(&recipe, &registry);
                for warning in &report.warnings {
                    warn!(file = %recipe_path.display(), "{warning}");
                }
                if report.is_ok() {
                    info!(file = %recipe_path.display(), "Lint passed");
                } else {
                    failures += 1;
                    for error_msg in &report.errors {
                        error!(file = %recipe_path.display(), "{error_msg}");
                    }
                }
            }
            Err(err) => {
                failures += 1;
                error!(file = %recipe_path.display(), "Failed to load recipe: {err:#}");
            }
        }
    }

    if failures > 0 {
        bail!("Lint failed for {failures} recipe(s)");
    }

    info!("All recipe lint checks passed");
    Ok(())
}

fn diff_recipes(lhs: &Path, rhs: &Path) -> Result<()> {
    let left = Recipe::load(lhs)?;
    let right = Recipe::load(rhs)?;

    let mut differences = Vec::new();

    if left.version != right.version {
        differences.push(format!(
            "Version mismatch: {} vs {}",
            left.version, right.version
        ));
    }

    if left.name != right.name {
        differences.push(format!(
            "Pipeline name differs: '{}' vs '{}'",
            left.name, right.name
        ));
    }

    if left.inputs != right.inputs {
        differences.push(format!(
            "Inputs differ: {:?} vs {:?}",
            left.inputs, right.inputs
        ));
    }

    if left.parameters != right.parameters {
        differences.push(format!(
            "Parameters differ: {} vs {}",
            render_json(&left.parameters),
            render_json(&right.parameters)
        ));
    }

    let min_len = left.steps.len().min(right.steps.len());
    if left.steps.len() != right.steps.len() {
        differences.push(format!(
            "Step count differs: {} vs {}",
            left.steps.len(),
            right.steps.len()
        ));
    }

    for (idx, (l_step, r_step)) in left.steps.iter().zip(right.steps.iter()).enumerate() {
        if l_step.display_name() != r_step.display_name() || l_step.step != r_step.step {
            differences.push(format!(
                "Step {} differs: '{}' ({}) vs '{}' ({})",
                idx + 1,
                l_step.display_name(),
                l_step.step,
                r_step.display_name(),
                r_step.step
            ));
        }
        let l_params = l_step.params.clone().unwrap_or_default();
        let r_params = r_step.params.clone().unwrap_or_default();
        if l_params != r_params {
            differences.push(format!(
                "Step {} ('{}') parameters differ: {} vs {}",
                idx + 1,
                l_step.display_name(),
                render_json(&l_params),
                render_json(&r_params)
            ));
        }
        if l_step.inputs != r_step.inputs || l_step.outputs != r_step.outputs {
            differences.push(format!(
                "Step {} ('{}') bindings differ",
                idx + 1,
                l_step.display_name()
            ));
        }
    }

    for (side, recipe) in [("left", &left), ("right", &right)] {
        for (extra_idx, step) in recipe.steps[min_len..].iter().enumerate() {
            differences.push(format!(
                "Extra step in {side} recipe at position {}: '{}'",
                min_len + extra_idx + 1,
                step.display_name()
            ));
        }
    }

    if left.output.directory != right.output.directory {
        differences.push(format!(
            "Output directory differs: '{}' vs '{}'",
            left.output.directory.display(),
            right.output.directory.display()
        ));
    }

    if left.serving != right.serving {
        differences.push(format!(
            "Serving differs: {} vs {}",
            render_json(&left.serving),
            render_json(&right.serving)
        ));
    }

    if differences.is_empty() {
        info!(
            left = %lhs.display(),
            right = %rhs.display(),
            "Recipes are equivalent"
        );
        println!("Recipes match: {} == {}", lhs.display(), rhs.display());
        Ok(())
    } else {
        println!(
            "Recipe differences between '{}' and '{}':",
            lhs.display(),
            rhs.display()
        );
        for diff in &differences {
            println!("- {diff}");
        }
        bail!("Recipes differ ({} difference(s) found)", differences.len());
    }
}

fn render_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "<invalid>".into())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let file =
        File::create(path).with_context(|| format!("Failed to create file: {}", path.display()))?;
    to_writer_pretty(file, value)
        .with_context(|| format!("Failed to write JSON: {}", path.display()))
}

#[derive(Parser)]
#[command(
    name = "spaceflights",
    version,
    about = "Spaceflights shuttle price model: preprocess, train, evaluate, deploy"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a recipe end to end.
    Run {
        recipe: PathBuf,
        #[arg(long)]
        dry_run: bool,
        #[arg(long, value_enum, default_value_t = SchedulePolicy::Sequential)]
        schedule: SchedulePolicy,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long = "metrics-listen")]
        metrics_listen: Option<String>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
        /// Write the per-step run report as JSON.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Print the resolved step graph.
    Graph {
        recipe: PathBuf,
        #[arg(long)]
        json: bool,
    },
    ListSteps,
    Validate {
        recipe: PathBuf,
    },
    Lock {
        recipe: PathBuf,
        output: PathBuf,
    },
    Recipe {
        #[command(subcommand)]
        action: RecipeCommands,
    },
}

#[derive(Subcommand)]
enum RecipeCommands {
    New {
        #[arg(long)]
        preset: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Lint {
        #[arg(required = true)]
        recipes: Vec<String>,
    },
    Diff {
        lhs: PathBuf,
        rhs: PathBuf,
    },
}
