//! Binary entry point for the Penumbra administrative CLI.
#![forbid(unsafe_code)]

mod config;
mod ui;

use std::error::Error;
use std::io;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use penumbra::admin::{
    self, AdminGcOptions, AdminOpenOptions, BranchesReport, ClientsReport, DatabasesReport,
    GcReport, HeadsReport, VerifyLevel, VerifyReport,
};
use tracing_subscriber::EnvFilter;

use config::{CliConfig, Profile};
use ui::{human_duration, Theme, Ui};

#[derive(Parser, Debug)]
#[command(
    name = "penumbra",
    version,
    about = "Administrative CLI for Penumbra data directories",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "PENUMBRA_DATA_DIR",
        value_name = "DIR",
        help = "Directory holding the store files"
    )]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true, env = "PENUMBRA_CONFIG", value_name = "FILE", help = "CLI config file")]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Config profile to use")]
    profile: Option<String>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(long, global = true, value_enum, default_value_t = Theme::Auto, help = "Color theme")]
    theme: Theme,

    #[arg(long, short, global = true, help = "Plain output without decorations")]
    quiet: bool,

    #[arg(
        long,
        global = true,
        env = "PENUMBRA_LOG",
        default_value = "warn",
        help = "Log filter (tracing EnvFilter syntax)"
    )]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "List the heads set in a store")]
    Heads {
        #[arg(value_name = "NAME")]
        name: String,
    },

    #[command(about = "List the clients registered in a store")]
    Clients {
        #[arg(value_name = "NAME")]
        name: String,
    },

    #[command(about = "List the branches registered in a store")]
    Branches {
        #[arg(value_name = "NAME")]
        name: String,
    },

    #[command(about = "List the stores registered in the data directory")]
    Databases,

    #[command(about = "Collect inactive clients and orphaned branches")]
    Gc {
        #[arg(value_name = "NAME")]
        name: String,

        #[arg(long, value_name = "SECS", help = "Collect clients silent for longer than this")]
        max_inactive_secs: Option<u64>,

        #[arg(long, help = "Also drop idle stores from the data directory")]
        collect_databases: bool,
    },

    #[command(about = "Check that every reference in a store resolves")]
    Verify {
        #[arg(value_name = "NAME")]
        name: String,

        #[arg(long, value_enum, default_value_t = VerifyLevelArg::Fast)]
        level: VerifyLevelArg,
    },

    #[command(about = "Show the resolved CLI configuration")]
    Config,

    #[command(about = "Generate shell completions")]
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum VerifyLevelArg {
    Fast,
    Full,
}

impl From<VerifyLevelArg> for VerifyLevel {
    fn from(level: VerifyLevelArg) -> Self {
        match level {
            VerifyLevelArg::Fast => VerifyLevel::Fast,
            VerifyLevelArg::Full => VerifyLevel::Full,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let ui = Ui::new(cli.theme, cli.quiet);
    match run(cli, &ui) {
        Ok(code) => process::exit(code),
        Err(err) => {
            ui.error(&err.to_string());
            process::exit(1);
        }
    }
}

fn init_logging(filter: &str) -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(filter)?)
        .with_writer(io::stderr)
        .with_target(true)
        .try_init()
        .map_err(|err| format!("failed to initialize logging: {err}").into())
}

fn run(cli: Cli, ui: &Ui) -> Result<i32, Box<dyn Error>> {
    if let Command::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "penumbra", &mut io::stdout());
        return Ok(0);
    }
    init_logging(&cli.log)?;

    let config = CliConfig::load(cli.config.clone())?;
    let profile = match cli.profile.as_deref().or(config.default_profile_name()) {
        Some(name) => Some(config.profile(name)?),
        None => None,
    };
    if let Command::Config = cli.command {
        print_config(ui, cli.format, &config, profile, cli.data_dir)?;
        return Ok(0);
    }

    let data_dir = config.resolve_data_dir(cli.data_dir, profile)?;
    let open_opts = AdminOpenOptions::default();

    match cli.command {
        Command::Heads { name } => {
            let report = admin::heads(&data_dir, &name, &open_opts)?;
            emit(cli.format, &report, || print_heads_text(ui, &report))?;
        }
        Command::Clients { name } => {
            let report = admin::clients(&data_dir, &name, &open_opts)?;
            emit(cli.format, &report, || print_clients_text(ui, &report))?;
        }
        Command::Branches { name } => {
            let report = admin::branches(&data_dir, &name, &open_opts)?;
            emit(cli.format, &report, || print_branches_text(ui, &report))?;
        }
        Command::Databases => {
            let report = admin::databases(&data_dir, &open_opts)?;
            emit(cli.format, &report, || print_databases_text(ui, &report))?;
        }
        Command::Gc {
            name,
            max_inactive_secs,
            collect_databases,
        } => {
            let defaults = config.gc_defaults(profile);
            let mut gc_opts = AdminGcOptions {
                collect_databases: collect_databases || defaults.collect_databases,
                ..AdminGcOptions::default()
            };
            if let Some(max_inactive) = max_inactive_secs.map(Duration::from_secs).or(defaults.client_max_inactive) {
                gc_opts.client_max_inactive = max_inactive;
            }
            let spinner = ui.spinner(format!("collecting {name}"));
            let report = admin::gc(&data_dir, &name, &open_opts, &gc_opts)?;
            let elapsed = spinner.stop();
            emit(cli.format, &report, || print_gc_text(ui, &report, elapsed))?;
        }
        Command::Verify { name, level } => {
            let spinner = ui.spinner(format!("verifying {name}"));
            let report = admin::verify(&data_dir, &name, &open_opts, level.into())?;
            spinner.stop();
            emit(cli.format, &report, || print_verify_text(ui, &report))?;
            if !report.success {
                return Ok(2);
            }
        }
        Command::Config | Command::Completions { .. } => {}
    }
    Ok(0)
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: FnOnce(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_config(
    ui: &Ui,
    format: OutputFormat,
    config: &CliConfig,
    profile: Option<&Profile>,
    flag: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let data_dir = config.resolve_data_dir(flag, profile).ok();
    let value = serde_json::json!({
        "config_path": config.path(),
        "profile": profile.map(|p| p.name.as_str()),
        "data_dir": data_dir,
    });
    emit(format, &value, || {
        ui.fields(
            "Config",
            [
                ("path", display_or_none(config.path().map(|p| p.display().to_string()))),
                ("profile", display_or_none(profile.map(|p| p.name.clone()))),
                ("data_dir", display_or_none(data_dir.map(|p| p.display().to_string()))),
            ],
        );
    })
}

fn display_or_none(value: Option<String>) -> String {
    value.unwrap_or_else(|| "-".to_string())
}

fn print_heads_text(ui: &Ui, report: &HeadsReport) {
    ui.fields(
        format!("Heads of {}", report.database).as_str(),
        report.heads.iter().map(|h| (h.name.as_str(), ui.hash(&h.hash))),
    );
}

fn print_clients_text(ui: &Ui, report: &ClientsReport) {
    ui.records(
        &format!("Clients of {}", report.database),
        report.clients.iter().map(|c| {
            let mut line = format!(
                "{} branch={} head={} idle={}",
                c.id,
                c.branch_id,
                ui.hash(&c.head_hash),
                human_duration(Duration::from_millis(c.idle_ms))
            );
            if let Some(pinned) = &c.temp_refresh_hash {
                line.push_str(&format!(" {}={}", ui.flag("refreshing"), ui.hash(pinned)));
            }
            line
        }),
    );
}

fn print_branches_text(ui: &Ui, report: &BranchesReport) {
    ui.records(
        &format!("Branches of {}", report.database),
        report.branches.iter().map(|b| {
            let mut line = format!(
                "{} head={} clients={} mutators={}",
                b.id,
                ui.hash(&b.head_hash),
                b.clients,
                b.mutator_names.join(",")
            );
            if b.pending {
                line.push(' ');
                line.push_str(&ui.flag("pending"));
            }
            if b.disabled {
                line.push(' ');
                line.push_str(&ui.flag("disabled"));
            }
            line
        }),
    );
}

fn print_databases_text(ui: &Ui, report: &DatabasesReport) {
    ui.records(
        &format!("Stores in {}", report.data_dir),
        report.databases.iter().map(|d| {
            format!(
                "{} app={} schema={} format={}",
                d.name, d.app_name, d.schema_version, d.format_version
            )
        }),
    );
}

fn print_gc_text(ui: &Ui, report: &GcReport, elapsed: Duration) {
    ui.verdict(
        true,
        &format!("collected {} in {}", report.database, human_duration(elapsed)),
    );
    ui.fields(
        "Registries",
        [
            ("clients", format!("{} -> {}", report.clients_before, report.clients_after)),
            ("branches", format!("{} -> {}", report.branches_before, report.branches_after)),
        ],
    );
    if !report.dropped_databases.is_empty() {
        ui.records("Dropped stores", report.dropped_databases.iter().cloned());
    }
}

fn print_verify_text(ui: &Ui, report: &VerifyReport) {
    ui.verdict(
        report.success,
        &format!("{:?} verify of {}: {} errors", report.level, report.database, report.errors),
    );
    ui.fields(
        "Counts",
        [
            ("clients", report.counts.clients),
            ("branches", report.counts.branches),
            ("chunks", report.counts.chunks_reachable),
            ("chunk_bytes", report.counts.chunk_bytes),
            ("commits", report.counts.commits),
            ("entries", report.counts.entries),
        ],
    );
    if !report.findings.is_empty() {
        println!("Findings");
        for finding in &report.findings {
            ui.finding(finding.severity, &finding.to_string());
        }
        if report.omitted > 0 {
            println!("  ... {} more", report.omitted);
        }
    }
}
