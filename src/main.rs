use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use segment_agent::compression::Codec;
use segment_agent::config::{AgentConfig, AgentOptions, Mode};
use segment_agent::failure::{CancelToken, ErrorPolicy, FailureController};
use segment_agent::fifo::FifoTransport;
use segment_agent::signals::{self, Teardown};
use segment_agent::{agent, logging, manifest, pipes, AgentError};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "segment-agent")]
#[command(
    version,
    about = "Stream table data between COPY pipes and a segment's compressed archive"
)]
#[command(group(ArgGroup::new("mode").required(true).multiple(false).args(["backup_agent", "restore_agent"])))]
struct Cli {
    /// Drain each table's pipe into the archive and write the TOC
    #[arg(long)]
    backup_agent: bool,

    /// Feed each requested table from the archive into its pipe
    #[arg(long)]
    restore_agent: bool,

    /// Segment TOC: written on backup, read on restore
    #[arg(long)]
    toc_file: PathBuf,

    /// File with one table oid per line
    #[arg(long)]
    oid_file: PathBuf,

    /// Prefix for pipe, skip marker and error sentinel paths
    #[arg(long)]
    pipe_file: PathBuf,

    /// Segment content id, used to tag log lines
    #[arg(long, default_value_t = -2, allow_hyphen_values = true)]
    content: i32,

    /// Archive file (or the plugin's name for it)
    #[arg(long)]
    data_file: PathBuf,

    /// Archive codec; on restore, inferred from the data file suffix if omitted
    #[arg(long, value_enum)]
    compression_type: Option<Codec>,

    /// Codec level; defaults to 1 when a codec is given
    #[arg(long, allow_hyphen_values = true)]
    compression_level: Option<i32>,

    /// Log and skip a table whose pipe transfer fails instead of aborting
    #[arg(long, default_value_t = false)]
    on_error_continue: bool,

    /// Storage plugin config; the archive then goes through the plugin
    #[arg(long)]
    plugin_config: Option<PathBuf>,

    /// Increase logging verbosity (use together with RUST_LOG for fine control).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{:#}", e);
            let code = e.downcast_ref::<AgentError>().map_or(1, AgentError::exit_code);
            std::process::exit(code);
        }
    }
}

fn run() -> Result<i32> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if !e.use_stderr() => {
            // --help and --version
            e.print().context("Failed to print usage")?;
            return Ok(0);
        }
        Err(e) => {
            e.print().context("Failed to print usage")?;
            if let Some(prefix) = pipe_file_arg(std::env::args_os()) {
                let first = e.to_string();
                let message = first.lines().next().unwrap_or_default();
                let message = message.strip_prefix("error: ").unwrap_or(message);
                write_startup_sentinel(&prefix, &AgentError::Config(message.to_string()));
            }
            return Ok(1);
        }
    };
    logging::init(cli.verbose)?;

    let prefix = cli.pipe_file.clone();
    let opts = AgentOptions {
        backup: cli.backup_agent,
        restore: cli.restore_agent,
        toc_file: cli.toc_file,
        oid_file: cli.oid_file,
        pipe_file: cli.pipe_file,
        content: cli.content,
        data_file: cli.data_file,
        compression_type: cli.compression_type,
        compression_level: cli.compression_level,
        on_error_continue: cli.on_error_continue,
        plugin_config: cli.plugin_config,
    };

    let cfg = match AgentConfig::from_options(opts) {
        Ok(cfg) => cfg,
        Err(e) => {
            write_startup_sentinel(&prefix, &e);
            return Err(e).context("Invalid agent configuration");
        }
    };

    let token = CancelToken::new();
    signals::install(token.clone(), teardown(&cfg))
        .context("Failed to install signal handling")?;

    tracing::info!(
        mode = ?cfg.mode,
        content = cfg.content,
        prefix = %cfg.prefix().display(),
        data_file = %cfg.data_file.display(),
        "segment agent starting"
    );

    let summary = agent::run(&cfg, FifoTransport::new(), token)?;

    if summary.skipped.is_empty() {
        Ok(0)
    } else {
        tracing::warn!(skipped = ?summary.skipped, "some tables were skipped");
        Ok(1)
    }
}

/// The orchestrator only looks at the sentinel, so a run that never got
/// going still leaves one behind when it knows where.
fn write_startup_sentinel(prefix: &Path, err: &AgentError) {
    if prefix.as_os_str().is_empty() {
        return;
    }
    FailureController::new(ErrorPolicy::Abort, pipes::sentinel_path(prefix), CancelToken::new())
        .run_aborted(err);
}

/// Best-effort `--pipe-file` lookup for command lines clap rejected.
fn pipe_file_arg(args: impl IntoIterator<Item = OsString>) -> Option<PathBuf> {
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--pipe-file" {
            return args.next().map(PathBuf::from);
        }
        if let Some(value) = arg.to_str().and_then(|a| a.strip_prefix("--pipe-file=")) {
            return Some(PathBuf::from(value));
        }
    }
    None
}

/// What the signal watcher may have to clean up if the engine gets stuck.
fn teardown(cfg: &AgentConfig) -> Teardown {
    // a bad list is reported by the run itself
    let pipes = manifest::load_oid_list(&cfg.oid_file)
        .map(|oids| oids.into_iter().map(|oid| cfg.pipe_path(oid)).collect())
        .unwrap_or_default();

    Teardown {
        pipes,
        sentinel: cfg.sentinel_path(),
        // backup blocks in open() on pipes with no writer yet
        wake_readers: cfg.mode == Mode::Backup,
    }
}
