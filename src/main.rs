use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use dws_lineage::config::{
    INSTANCE_ENV, LOG_ENV, default_repo_config_yaml, load_effective_config, resolve_instance,
    resolve_lineage_dir, resolve_log_level,
};
use dws_lineage::lineage::recorder::StepRecorder;
use dws_lineage::query::{
    export_lineage_for_resource, make_lineage_table, make_simplified_lineage_graph_for_resource,
    render_lineage_table,
};
use dws_lineage::store::snapshot_hash_for;
use dws_lineage::{FileLineageStore, LineageError, LineageStore, LineageView, ResourceRef};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
struct CliError {
    code: &'static str,
    message: String,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn io(code: &'static str, err: io::Error) -> Self {
        Self::new(code, err.to_string())
    }
}

impl From<LineageError> for CliError {
    fn from(value: LineageError) -> Self {
        Self::new(value.code(), value.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(value: serde_json::Error) -> Self {
        Self::new("json_error", value.to_string())
    }
}

#[derive(Parser, Debug)]
#[command(name = "dws-lineage")]
#[command(about = "Track which inputs, code and parameters produced each workspace resource")]
struct Cli {
    /// Lineage scope; defaults to $DWS_INSTANCE, the config, then the hostname.
    #[arg(long, global = true)]
    instance: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Init,
    Step(StepArgs),
    Show(ShowArgs),
    Table(TableArgs),
    Graph(GraphArgs),
    Export(ExportArgs),
    Snapshot(SnapshotArgs),
    Restore(RestoreArgs),
    Invalidate(InvalidateArgs),
}

#[derive(Args, Debug)]
struct StepArgs {
    name: String,
    #[arg(long = "input")]
    inputs: Vec<String>,
    #[arg(long = "code")]
    code: Vec<String>,
    #[arg(long = "output")]
    outputs: Vec<String>,
    /// `key=value`; values that parse as JSON are stored as JSON.
    #[arg(long = "param")]
    params: Vec<String>,
    /// Command to run as the step; lineage is recorded only if it succeeds.
    #[arg(last = true)]
    command: Vec<String>,
}

#[derive(Args, Debug)]
struct ShowArgs {
    resource_ref: String,
    #[arg(long)]
    snapshot: Option<String>,
}

#[derive(Args, Debug)]
struct TableArgs {
    #[arg(long)]
    snapshot: Option<String>,
    #[arg(long)]
    pretty: bool,
}

#[derive(Args, Debug)]
struct GraphArgs {
    resource_name: String,
    #[arg(long)]
    snapshot: Option<String>,
    /// Write Graphviz source here instead of printing the graph as JSON.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ExportArgs {
    resource_name: String,
    #[arg(long)]
    snapshot: Option<String>,
}

#[derive(Args, Debug)]
struct SnapshotArgs {
    /// `resource=hash` for every resource in the snapshot.
    #[arg(long = "hash")]
    hashes: Vec<String>,
    #[arg(long)]
    snapshot_hash: Option<String>,
}

#[derive(Args, Debug)]
struct RestoreArgs {
    snapshot_hash: String,
    resources: Vec<String>,
}

#[derive(Args, Debug)]
struct InvalidateArgs {
    resource_ref: String,
}

#[derive(Debug, Clone)]
struct WorkspacePaths {
    lineage_dir: PathBuf,
    repo_config: PathBuf,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let payload = json!({
                "error": {
                    "code": err.code,
                    "message": err.message,
                }
            });
            eprintln!("{payload}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().map_err(|err| CliError::io("cwd_error", err))?;
    let home = home_dir()?;
    let repo_config = cwd.join(".dws").join("config.yml");
    let user_config = home.join(".dws").join("config.yml");
    let config = load_effective_config(&cwd, Some(&repo_config), Some(&user_config))
        .map_err(|err| CliError::new("config_error", err.to_string()))?;
    init_logging(resolve_log_level(&config));

    let env_instance = std::env::var(INSTANCE_ENV).ok();
    let instance = resolve_instance(cli.instance.as_deref(), env_instance.as_deref(), &config)
        .map_err(|err| CliError::new("config_error", err.to_string()))?;
    let paths = WorkspacePaths {
        lineage_dir: resolve_lineage_dir(&config, &cwd, &home),
        repo_config,
    };
    let mut store = FileLineageStore::new(&paths.lineage_dir);

    match cli.command {
        Command::Init => cmd_init(&paths, &instance),
        Command::Step(args) => cmd_step(&cwd, &instance, &mut store, args),
        Command::Show(args) => cmd_show(&instance, &store, args),
        Command::Table(args) => cmd_table(&instance, &store, args),
        Command::Graph(args) => cmd_graph(&instance, &store, args),
        Command::Export(args) => cmd_export(&instance, &store, args),
        Command::Snapshot(args) => cmd_snapshot(&instance, &mut store, args),
        Command::Restore(args) => cmd_restore(&instance, &mut store, args),
        Command::Invalidate(args) => cmd_invalidate(&instance, &mut store, args),
    }
}

fn init_logging(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV)
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn cmd_init(paths: &WorkspacePaths, instance: &str) -> Result<(), CliError> {
    let store = FileLineageStore::new(&paths.lineage_dir);
    fs::create_dir_all(store.current_dir().join(instance))
        .map_err(|err| CliError::io("mkdir_error", err))?;
    fs::create_dir_all(store.snapshot_dir()).map_err(|err| CliError::io("mkdir_error", err))?;
    let wrote_config = write_default_config(&paths.repo_config)?;

    print_json(&json!({
        "status": "ok",
        "instance": instance,
        "lineage_dir": paths.lineage_dir,
        "config": paths.repo_config,
        "wrote_config": wrote_config,
    }))
}

fn cmd_step(
    cwd: &Path,
    instance: &str,
    store: &mut FileLineageStore,
    args: StepArgs,
) -> Result<(), CliError> {
    let mut recorder = StepRecorder::new(&args.name)
        .with_run_from_directory(cwd.to_string_lossy().into_owned());
    for raw in &args.params {
        let (key, value) = parse_param(raw)?;
        recorder = recorder.with_parameter(key, value);
    }
    for raw in &args.inputs {
        recorder = recorder.with_input(ResourceRef::parse(raw)?);
    }
    for raw in &args.code {
        recorder = recorder.with_code(ResourceRef::parse(raw)?);
    }
    if !args.command.is_empty() {
        recorder = recorder.with_command_line(args.command.iter().cloned());
    }
    let outputs = args
        .outputs
        .iter()
        .map(|raw| ResourceRef::parse(raw))
        .collect::<Result<Vec<_>, _>>()?;

    let mut step = recorder.start(instance, store)?;
    for output in outputs {
        step.add_output(output)?;
    }

    if let Some((program, rest)) = args.command.split_first() {
        let status = ProcessCommand::new(program)
            .args(rest)
            .current_dir(cwd)
            .stdout(io::stderr())
            .status()
            .map_err(|err| CliError::new("command_spawn_error", err.to_string()))?;
        if !status.success() {
            step.abort();
            return Err(CliError::new(
                "step_command_failed",
                format!(
                    "`{}` exited with {}; no lineage recorded",
                    args.command.join(" "),
                    status.code().map_or("a signal".to_string(), |code| code.to_string())
                ),
            ));
        }
    }

    let lineage = step.complete()?;
    let outputs = lineage
        .output_resources()
        .map(|cert| cert.to_json())
        .collect::<Vec<_>>();
    print_json(&json!({
        "status": "ok",
        "instance": instance,
        "step_name": lineage.step_name,
        "execution_time_seconds": lineage.execution_time_seconds,
        "outputs": outputs,
    }))
}

fn cmd_show(instance: &str, store: &FileLineageStore, args: ShowArgs) -> Result<(), CliError> {
    let resource_ref = ResourceRef::parse(&args.resource_ref)?;
    let view = view_for(args.snapshot);
    let lineage = store.retrieve_in_view(instance, &resource_ref, &view)?;
    print_json(&json!({
        "ref": resource_ref.to_json(),
        "certificate": lineage.cert_for(&resource_ref).map(|cert| cert.to_json()),
        "lineage": lineage.to_json(),
    }))
}

fn cmd_table(instance: &str, store: &FileLineageStore, args: TableArgs) -> Result<(), CliError> {
    let rows = make_lineage_table(instance, store, &view_for(args.snapshot))?;
    if args.pretty {
        print!("{}", render_lineage_table(&rows));
        return Ok(());
    }
    let rows = rows.iter().map(|row| row.to_json()).collect::<Vec<_>>();
    print_json(&json!({ "rows": rows }))
}

fn cmd_graph(instance: &str, store: &FileLineageStore, args: GraphArgs) -> Result<(), CliError> {
    let view = view_for(args.snapshot);
    let graph =
        make_simplified_lineage_graph_for_resource(instance, store, &args.resource_name, &view)?;
    match args.output {
        Some(path) => {
            graph.write_dot(&path)?;
            print_json(&json!({
                "status": "ok",
                "path": path,
                "node_count": graph.nodes.len(),
                "edge_count": graph.edges.len(),
                "warnings": graph.warnings,
            }))
        }
        None => print_json(&graph.to_json()),
    }
}

fn cmd_export(instance: &str, store: &FileLineageStore, args: ExportArgs) -> Result<(), CliError> {
    let exported =
        export_lineage_for_resource(instance, store, &args.resource_name, &view_for(args.snapshot))?;
    print_json(&exported)
}

fn cmd_snapshot(
    instance: &str,
    store: &mut FileLineageStore,
    args: SnapshotArgs,
) -> Result<(), CliError> {
    let mut mapping = HashMap::new();
    for raw in &args.hashes {
        let (name, hashval) = raw.split_once('=').ok_or_else(|| {
            CliError::new("invalid_hash_arg", format!("expected resource=hash, got `{raw}`"))
        })?;
        if name.is_empty() || hashval.is_empty() {
            return Err(CliError::new(
                "invalid_hash_arg",
                format!("expected resource=hash, got `{raw}`"),
            ));
        }
        mapping.insert(name.to_string(), hashval.to_string());
    }
    let snapshot_hash = args
        .snapshot_hash
        .unwrap_or_else(|| snapshot_hash_for(&mapping));

    let replaced = store.replace_placeholders(instance, &mapping)?;
    let mut resources = mapping.keys().cloned().collect::<Vec<_>>();
    resources.sort();
    store.snapshot_lineage(instance, &snapshot_hash, &resources)?;

    print_json(&json!({
        "status": "ok",
        "snapshot_hash": snapshot_hash,
        "resources": resources,
        "replaced_placeholders": replaced,
    }))
}

fn cmd_restore(
    instance: &str,
    store: &mut FileLineageStore,
    args: RestoreArgs,
) -> Result<(), CliError> {
    let resources = if args.resources.is_empty() {
        if !store.snapshot_exists(&args.snapshot_hash) {
            return Err(CliError::new(
                "missing_resources",
                "snapshot has no archived lineage; name the resources to restore",
            ));
        }
        store.snapshot_resource_names(&args.snapshot_hash)?
    } else {
        args.resources
    };
    let archived = store.snapshot_exists(&args.snapshot_hash);
    store.restore_lineage(instance, &args.snapshot_hash, &resources)?;

    print_json(&json!({
        "status": "ok",
        "snapshot_hash": args.snapshot_hash,
        "resources": resources,
        "archived": archived,
    }))
}

fn cmd_invalidate(
    instance: &str,
    store: &mut FileLineageStore,
    args: InvalidateArgs,
) -> Result<(), CliError> {
    let resource_ref = ResourceRef::parse(&args.resource_ref)?;
    if resource_ref.subpath().is_some() {
        store.invalidate_entry(instance, &resource_ref)?;
    } else {
        store.invalidate_resource(instance, resource_ref.name())?;
    }
    print_json(&json!({
        "status": "ok",
        "invalidated": resource_ref.to_string(),
    }))
}

fn view_for(snapshot: Option<String>) -> LineageView {
    match snapshot {
        Some(hash) => LineageView::Snapshot(hash),
        None => LineageView::Current,
    }
}

fn parse_param(raw: &str) -> Result<(String, Value), CliError> {
    let (key, value) = raw.split_once('=').ok_or_else(|| {
        CliError::new("invalid_param", format!("expected key=value, got `{raw}`"))
    })?;
    if key.is_empty() {
        return Err(CliError::new(
            "invalid_param",
            format!("empty parameter name in `{raw}`"),
        ));
    }
    let value = serde_json::from_str::<Value>(value).unwrap_or_else(|_| json!(value));
    Ok((key.to_string(), value))
}

fn write_default_config(config_path: &Path) -> Result<bool, CliError> {
    if config_path.exists() {
        return Ok(false);
    }
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|err| CliError::io("mkdir_error", err))?;
    }
    fs::write(config_path, default_repo_config_yaml())
        .map_err(|err| CliError::io("write_error", err))?;
    Ok(true)
}

fn home_dir() -> Result<PathBuf, CliError> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| CliError::new("home_error", "HOME environment variable is not set"))
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string(value)?;
    println!("{rendered}");
    Ok(())
}
