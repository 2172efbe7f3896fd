use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use openv::api::{self, AppState};
use openv::auth::{AuthConfig, AuthState};
use openv::db::Database;
use openv::sandbox::{
    ContainerRuntimeApi, DockerRuntime, SandboxLimits, SandboxOrchestrator, WorkspaceResolver,
    validate_image_name,
};
use openv::session::{
    CycleReport, DEFAULT_COMMAND, DEFAULT_IMAGE, Reconciler, ReconcilerSettings,
    SessionRepository, SessionService, SessionServiceConfig,
};

const APP_NAME: &str = "openv";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

#[tokio::main]
async fn async_reconcile(ctx: RuntimeContext, cmd: ReconcileCommand) -> Result<()> {
    handle_reconcile(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_serve(ctx, cmd),
        Command::Reconcile(cmd) => async_reconcile(ctx, cmd),
        Command::Token(cmd) => handle_token(&ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "OpenV - ephemeral per-project sandbox server.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Assume "yes" for interactive prompts
    #[arg(short = 'y', long = "yes", alias = "force", global = true)]
    assume_yes: bool,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server and the reconciler
    Serve(ServeCommand),
    /// Reconcile session records against the container engine
    Reconcile(ReconcileCommand),
    /// Issue a bearer token for a tenant
    Token(TokenCommand),
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides server.host)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,
    /// Default container image (overrides sandbox.image)
    #[arg(long)]
    image: Option<String>,
    /// Host directory holding project workspaces (overrides sandbox.workspace_root)
    #[arg(long, value_name = "PATH")]
    workspace_root: Option<PathBuf>,
    /// Do not run the background reconciler
    #[arg(long = "no-reconcile")]
    no_reconcile: bool,
}

#[derive(Debug, Clone, Args)]
struct ReconcileCommand {
    /// Run a single cycle and print its report instead of looping
    #[arg(long)]
    once: bool,
}

#[derive(Debug, Clone, Args)]
struct TokenCommand {
    /// Tenant the token speaks for
    #[arg(value_name = "TENANT_ID")]
    tenant_id: i64,
    /// Lifetime in seconds
    #[arg(long, default_value = "3600")]
    ttl: i64,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let mut paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&mut paths, &common)?;
        config.validate()?;
        let paths = paths.apply_overrides(&config)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("openv={level},tower_http={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // `log` users (services, reconciler, bridge)
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else if self.common.verbose > 0 {
            match self.common.verbose {
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        } else {
            self.config
                .logging
                .level
                .parse()
                .unwrap_or(LevelFilter::Info)
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        if self.common.dry_run {
            info!(
                "dry-run: would ensure data dir {} and state dir {}",
                self.paths.data_dir.display(),
                self.paths.state_dir.display()
            );
            return Ok(());
        }

        fs::create_dir_all(&self.paths.data_dir).with_context(|| {
            format!("creating data directory {}", self.paths.data_dir.display())
        })?;
        fs::create_dir_all(&self.paths.state_dir).with_context(|| {
            format!(
                "creating state directory {}",
                self.paths.state_dir.display()
            )
        })?;
        Ok(())
    }

    fn database_path(&self) -> PathBuf {
        self.paths.data_dir.join("openv.db")
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
    state_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
            state_dir: default_state_dir()?,
        })
    }

    fn apply_overrides(mut self, cfg: &AppConfig) -> Result<Self> {
        if let Some(ref data_override) = cfg.paths.data_dir {
            self.data_dir = expand_str_path(data_override)?;
        }
        if let Some(ref state_override) = cfg.paths.state_dir {
            self.state_dir = expand_str_path(state_override)?;
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    logging: LoggingConfig,
    paths: PathsConfig,
    server: ServerConfig,
    sandbox: SandboxConfig,
    reconciler: ReconcilerConfig,
    terminal: TerminalConfig,
    auth: AuthConfig,
}

impl AppConfig {
    /// Reject settings that would make the service misbehave rather than fail.
    fn validate(&self) -> Result<()> {
        check_duration(
            "reconciler.interval_seconds",
            self.reconciler.interval_seconds,
            MAX_INTERVAL_SECONDS,
        )?;
        check_duration(
            "reconciler.idle_timeout_minutes",
            self.reconciler.idle_timeout_minutes,
            MAX_IDLE_TIMEOUT_MINUTES,
        )?;
        if self.reconciler.orphan_grace_seconds > MAX_INTERVAL_SECONDS {
            bail!(
                "reconciler.orphan_grace_seconds must be at most {}",
                MAX_INTERVAL_SECONDS
            );
        }
        check_duration(
            "terminal.heartbeat_seconds",
            self.terminal.heartbeat_seconds,
            MAX_HEARTBEAT_SECONDS,
        )?;

        let sandbox = &self.sandbox;
        validate_name_prefix(&sandbox.name_prefix)?;
        validate_image_name(&sandbox.image).context("sandbox.image")?;
        if sandbox.shell.is_empty() {
            bail!("sandbox.shell must name a program");
        }
        if sandbox.memory_limit_bytes < MIN_MEMORY_LIMIT_BYTES {
            bail!(
                "sandbox.memory_limit_bytes must be at least {} (6MiB), got {}",
                MIN_MEMORY_LIMIT_BYTES,
                sandbox.memory_limit_bytes
            );
        }
        if !sandbox.cpu_quota.is_finite() || sandbox.cpu_quota <= 0.0 {
            bail!(
                "sandbox.cpu_quota must be a positive number, got {}",
                sandbox.cpu_quota
            );
        }
        Ok(())
    }
}

/// Longest reconciler interval and orphan grace: one day.
const MAX_INTERVAL_SECONDS: u64 = 24 * 60 * 60;
/// Longest idle timeout: 30 days.
const MAX_IDLE_TIMEOUT_MINUTES: u64 = 30 * 24 * 60;
/// Longest terminal heartbeat: one hour.
const MAX_HEARTBEAT_SECONDS: u64 = 60 * 60;
/// Engine minimum for a memory limit.
const MIN_MEMORY_LIMIT_BYTES: i64 = 6 * 1024 * 1024;
const MAX_NAME_PREFIX_LEN: usize = 32;

fn check_duration(key: &str, value: u64, max: u64) -> Result<()> {
    if value == 0 {
        bail!("{key} must be greater than zero");
    }
    if value > max {
        bail!("{key} must be at most {max}, got {value}");
    }
    Ok(())
}

/// The prefix starts every container name, so it must be a valid name itself.
fn validate_name_prefix(prefix: &str) -> Result<()> {
    let Some(first) = prefix.chars().next() else {
        bail!("sandbox.name_prefix must be non-empty");
    };
    if prefix.len() > MAX_NAME_PREFIX_LEN {
        bail!("sandbox.name_prefix must be at most {MAX_NAME_PREFIX_LEN} characters");
    }
    if !first.is_ascii_alphanumeric() {
        bail!("sandbox.name_prefix must start with a letter or digit");
    }
    if !prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!("sandbox.name_prefix {prefix:?} may only contain letters, digits, '-' and '_'");
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PathsConfig {
    data_dir: Option<String>,
    state_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ServerConfig {
    host: String,
    port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Container engine and sandbox launch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct SandboxConfig {
    /// Engine socket. Unset uses `DOCKER_HOST` or the platform default.
    engine_socket: Option<String>,
    /// Engine request timeout in seconds.
    engine_timeout_seconds: u64,
    /// Host directory holding `<tenant>/<session>` workspaces.
    workspace_root: String,
    image: String,
    /// Long-running command that keeps the sandbox alive.
    command: Vec<String>,
    /// Program started for interactive terminals.
    shell: Vec<String>,
    memory_limit_bytes: i64,
    /// Fraction of one core.
    cpu_quota: f64,
    run_as_user: String,
    name_prefix: String,
    /// Extra environment for every sandbox.
    extra_env: HashMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let limits = SandboxLimits::default();
        Self {
            engine_socket: None,
            engine_timeout_seconds: 120,
            workspace_root: "/tmp/openv_projects".to_string(),
            image: DEFAULT_IMAGE.to_string(),
            command: DEFAULT_COMMAND.iter().map(|s| s.to_string()).collect(),
            shell: limits.shell,
            memory_limit_bytes: limits.memory_limit_bytes,
            cpu_quota: limits.cpu_quota,
            run_as_user: limits.run_as_user,
            name_prefix: limits.name_prefix,
            extra_env: HashMap::new(),
        }
    }
}

impl SandboxConfig {
    fn limits(&self) -> SandboxLimits {
        SandboxLimits {
            name_prefix: self.name_prefix.clone(),
            memory_limit_bytes: self.memory_limit_bytes,
            cpu_quota: self.cpu_quota,
            run_as_user: self.run_as_user.clone(),
            shell: self.shell.clone(),
            ..SandboxLimits::default()
        }
    }

    fn service_config(&self) -> SessionServiceConfig {
        SessionServiceConfig {
            image: self.image.clone(),
            command: self.command.clone(),
            extra_env: self.extra_env.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ReconcilerConfig {
    /// Run the reconciler inside `serve`.
    enabled: bool,
    interval_seconds: u64,
    idle_timeout_minutes: u64,
    /// Unrecorded containers younger than this are not treated as orphans yet.
    orphan_grace_seconds: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 300,
            idle_timeout_minutes: 60,
            orphan_grace_seconds: 60,
        }
    }
}

impl ReconcilerConfig {
    fn settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            interval: Duration::from_secs(self.interval_seconds),
            idle_timeout: Duration::from_secs(self.idle_timeout_minutes * 60),
            orphan_grace: Duration::from_secs(self.orphan_grace_seconds),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct TerminalConfig {
    /// Seconds between activity heartbeats of an open terminal.
    heartbeat_seconds: u64,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            heartbeat_seconds: 60,
        }
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
                );
            } else {
                println!("{:#?}", ctx.config);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

fn handle_token(ctx: &RuntimeContext, cmd: TokenCommand) -> Result<()> {
    if cmd.ttl <= 0 {
        bail!("--ttl must be greater than zero");
    }

    let auth_config = ctx.config.auth.clone();
    auth_config
        .validate()
        .context("Invalid auth configuration")?;
    let token = AuthState::new(auth_config)
        .generate_token(cmd.tenant_id, cmd.ttl)
        .context("issuing token")?;

    println!("{token}");
    Ok(())
}

/// Connect to the container engine. A failed connection is not fatal: the
/// orchestrator then answers every call with `EngineUnavailable`.
fn connect_engine(config: &SandboxConfig) -> Option<Arc<dyn ContainerRuntimeApi>> {
    let connected = match config.engine_socket {
        Some(ref socket) => expand_str_path(socket).and_then(|path| {
            DockerRuntime::connect_socket(&path, config.engine_timeout_seconds)
                .map_err(anyhow::Error::from)
        }),
        None => DockerRuntime::connect_local().map_err(anyhow::Error::from),
    };

    match connected {
        Ok(runtime) => Some(Arc::new(runtime) as Arc<dyn ContainerRuntimeApi>),
        Err(e) => {
            warn!(
                "Container engine client unavailable: {:#}. Sandbox operations will fail.",
                e
            );
            None
        }
    }
}

async fn build_orchestrator(ctx: &RuntimeContext) -> Result<Arc<SandboxOrchestrator>> {
    let sandbox = &ctx.config.sandbox;
    let workspace_root = expand_str_path(&sandbox.workspace_root)?;
    if !ctx.common.dry_run {
        fs::create_dir_all(&workspace_root).with_context(|| {
            format!(
                "creating workspace root {}",
                workspace_root.display()
            )
        })?;
    }
    info!("Workspace root: {}", workspace_root.display());

    let orchestrator = SandboxOrchestrator::new(
        connect_engine(sandbox),
        WorkspaceResolver::new(workspace_root),
        sandbox.limits(),
    );

    match orchestrator.health_check().await {
        Ok(()) => info!("Container engine is available"),
        Err(e) => warn!(
            "Container engine health check failed: {}. Sandbox operations may fail.",
            e
        ),
    }

    Ok(Arc::new(orchestrator))
}

async fn open_database(ctx: &RuntimeContext) -> Result<Database> {
    let db_path = ctx.database_path();
    info!("Database path: {}", db_path.display());
    Database::open(&db_path).await
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    info!("Starting sandbox server...");

    let mut config = ctx.config.clone();
    if let Some(image) = cmd.image {
        config.sandbox.image = image;
    }
    if let Some(root) = cmd.workspace_root {
        config.sandbox.workspace_root = root.display().to_string();
    }
    config.validate()?;
    let ctx = RuntimeContext {
        config,
        ..ctx.clone()
    };

    let auth_config = ctx.config.auth.clone();
    auth_config
        .validate()
        .context("Invalid auth configuration")?;
    let auth_state = AuthState::new(auth_config);

    let database = open_database(&ctx).await?;
    let orchestrator = build_orchestrator(&ctx).await?;
    let repo = SessionRepository::new(database.pool().clone());

    let sessions = Arc::new(SessionService::new(
        repo.clone(),
        orchestrator.clone(),
        ctx.config.sandbox.service_config(),
    ));

    let cancel = CancellationToken::new();
    let reconciler_task = if ctx.config.reconciler.enabled && !cmd.no_reconcile {
        let reconciler = Arc::new(Reconciler::new(
            orchestrator,
            repo,
            ctx.config.reconciler.settings(),
        ));
        Some(reconciler.spawn(cancel.clone()))
    } else {
        info!("Reconciler disabled");
        None
    };

    let state = AppState::new(sessions, auth_state)
        .with_heartbeat(Duration::from_secs(ctx.config.terminal.heartbeat_seconds));
    let app = api::create_router(state);

    let host = cmd.host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = cmd.port.unwrap_or(ctx.config.server.port);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("invalid address")?;

    info!("Listening on http://{}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;

    let cancel_on_signal = cancel.clone();
    let shutdown = async move {
        shutdown_signal().await;
        info!("Shutdown signal received, stopping reconciler...");
        cancel_on_signal.cancel();
    };

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("running server");

    cancel.cancel();
    let joined = match reconciler_task {
        Some(task) => task.await,
        None => Ok(()),
    };
    if let Err(e) = joined {
        warn!("Reconciler task ended abnormally: {}", e);
    }

    info!("Shutdown complete");
    served
}

async fn handle_reconcile(ctx: &RuntimeContext, cmd: ReconcileCommand) -> Result<()> {
    let database = open_database(ctx).await?;
    let orchestrator = build_orchestrator(ctx).await?;
    let reconciler = Arc::new(Reconciler::new(
        orchestrator,
        SessionRepository::new(database.pool().clone()),
        ctx.config.reconciler.settings(),
    ));

    if !cmd.once {
        let cancel = CancellationToken::new();
        let task = reconciler.spawn(cancel.clone());
        shutdown_signal().await;
        cancel.cancel();
        task.await.context("waiting for reconciler")?;
        return Ok(());
    }

    if ctx.common.dry_run {
        info!("dry-run: would run one reconcile cycle");
        return Ok(());
    }

    let report = reconciler.run_cycle().await?;
    print_report(ctx, &report)
}

fn print_report(ctx: &RuntimeContext, report: &CycleReport) -> Result<()> {
    let output = if ctx.common.json {
        serde_json::to_string_pretty(report).context("serializing report to JSON")?
    } else if ctx.common.yaml {
        serde_yaml::to_string(report).context("serializing report to YAML")?
    } else {
        format!(
            "orphans removed: {}, orphan failures: {}, desynced: {}, evicted: {}, eviction failures: {}, stale: {}",
            report.orphans_removed,
            report.orphans_failed,
            report.desynced,
            report.evicted,
            report.eviction_failures,
            report.stale_skipped
        )
    };

    println!("{output}");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn load_or_init_config(paths: &mut AppPaths, common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080_i64)?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()?;

    let config: AppConfig = built.try_deserialize()?;
    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push_str("# Set auth.jwt_secret (or OPENV__AUTH__JWT_SECRET) before running `serve`.\n");
    buffer.push('\n');
    buffer
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::state_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("state").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine state directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}, state: {}",
            self.config_file.display(),
            self.data_dir.display(),
            self.state_dir.display()
        )
    }
}
