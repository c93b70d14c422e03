//! CLI tool for evaluating mlld documents
//!
//! Usage: mlld [COMMAND] [OPTIONS] <input.mld>
//!
//! With no command, evaluates the input document and writes the rendered
//! output (to a derived path, `--output`, or `--stdout`). Exit codes:
//! 0 success, 1 fatal error, 2 `/bail`, 3 cancelled.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use clap::{Parser, Subcommand};
use log::LevelFilter;
use mlld::checkpoint::{CheckpointManager, ResumeTarget};
use mlld::platform::StdFileSystem;
use mlld::{Interpreter, InterpreterOptions, MlldError, OutputFormat, OutputStream};

#[derive(Debug, Parser)]
#[command(name = "mlld", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Input document
    input: Option<PathBuf>,

    /// Write output to file (default derived from input + format)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output format
    #[arg(short, long, default_value = "markdown", value_parser = ["md", "markdown", "xml"])]
    format: String,

    /// Emit to stdout instead of a file
    #[arg(long)]
    stdout: bool,

    /// Stop on every error
    #[arg(long, conflicts_with = "permissive")]
    strict: bool,

    /// Log recoverable errors and continue (default)
    #[arg(long)]
    permissive: bool,

    /// Re-run on input change
    #[arg(long)]
    watch: bool,

    /// Enable URL imports and loads
    #[arg(long)]
    allow_urls: bool,

    #[arg(long, default_value_t = 30_000)]
    url_timeout: u64,

    #[arg(long, default_value_t = 5 * 1024 * 1024)]
    url_max_size: usize,

    /// Comma-separated domain allow list
    #[arg(long)]
    url_allowed_domains: Option<String>,

    /// Comma-separated domain deny list
    #[arg(long)]
    url_blocked_domains: Option<String>,

    /// Cache executable invocations
    #[arg(long, conflicts_with = "no_checkpoint")]
    checkpoint: bool,

    #[arg(long)]
    no_checkpoint: bool,

    /// Invalidate cached calls before the run (`@fn`, `@fn:idx`,
    /// `@fn("prefix")`, or a checkpoint name)
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    resume: Option<String>,

    /// Seed the cache read-only from another script's cache
    #[arg(long)]
    fork: Option<String>,

    /// Pretty-print objects and JSON output
    #[arg(long)]
    pretty: bool,

    /// Override $HOMEPATH
    #[arg(long)]
    home_path: Option<PathBuf>,

    /// Increase output verbosity, for debugging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Shorthand for maximum verbosity
    #[arg(short, long)]
    debug: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a starter document
    Init {
        /// Where to write it (default example.mld)
        path: Option<PathBuf>,
    },
    /// Render a sample error, for checking terminal display
    ErrorTest,
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let code = match &cli.command {
        Some(Command::Init { path }) => run_init(path.as_deref()),
        Some(Command::ErrorTest) => run_error_test(),
        None => run_document(&cli),
    };
    std::process::exit(code);
}

fn init_logging(cli: &Cli) {
    let level = if cli.debug || std::env::var("MLLD_DEBUG").as_deref() == Ok("true") {
        LevelFilter::Trace
    } else {
        match cli.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };
    env_logger::Builder::new()
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .filter_level(level)
        .init();
}

fn run_init(path: Option<&Path>) -> i32 {
    let target = path.unwrap_or(Path::new("example.mld"));
    let starter = "\
# Example

/var @name = \"world\"
/show `Hello, @name!`
";
    match std::fs::write(target, starter) {
        Ok(()) => {
            println!("wrote {}", target.display());
            0
        }
        Err(e) => {
            eprintln!("cannot write {}: {e}", target.display());
            1
        }
    }
}

fn run_error_test() -> i32 {
    let source = "/var @greeting = `hi`\n/show @missing\n";
    let err = MlldError::resolution_at(
        "variable @missing is not defined",
        mlld::SourceLocation::new(2, 7, 28),
    );
    eprintln!("{}", err.render_with_source(Some(source)));
    0
}

fn run_document(cli: &Cli) -> i32 {
    let Some(input) = &cli.input else {
        eprintln!("Usage: mlld [OPTIONS] <input.mld>");
        return 1;
    };

    loop {
        let code = evaluate_once(cli, input);
        if !cli.watch || code == 3 {
            return code;
        }
        if let Err(e) = wait_for_change(input) {
            eprintln!("watch failed: {e}");
            return 1;
        }
        eprintln!("--- {} changed, re-running", input.display());
    }
}

fn evaluate_once(cli: &Cli, input: &Path) -> i32 {
    let source = match std::fs::read_to_string(input) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("cannot read {}: {e}", input.display());
            return 1;
        }
    };

    let options = options_from(cli, input);
    let base_path = options.base_path.clone();
    let mut interp = Interpreter::new(options);

    let use_checkpoint =
        (cli.checkpoint || cli.resume.is_some() || cli.fork.is_some()) && !cli.no_checkpoint;
    if use_checkpoint {
        let cache_root = base_path.join(".mlld").join("cache");
        let script = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("script");
        let mut manager = CheckpointManager::open(Rc::new(StdFileSystem), &cache_root, script);
        if let Some(other) = &cli.fork {
            manager.fork_from(&cache_root, other);
        }
        if let Some(raw) = &cli.resume {
            match ResumeTarget::parse(raw).and_then(|t| manager.invalidate(&t)) {
                Ok(n) => log::info!("invalidated {n} checkpoint entries"),
                Err(e) => {
                    eprintln!("{e}");
                    return 1;
                }
            }
        }
        interp.set_checkpoint(manager);
    }

    let result = interp.run_source(&source, Some(input));
    flush_streams(&interp);
    for (name, value) in interp.env_outputs() {
        // Values exported by `/output ... to env`
        unsafe { std::env::set_var(name, value) };
    }

    match result {
        Ok(rendered) => {
            if let Err(e) = write_output(cli, input, &rendered) {
                eprintln!("{e}");
                return 1;
            }
            0
        }
        Err(err @ MlldError::Bail { .. }) => {
            eprintln!("{err}");
            let _ = write_output(cli, input, &interp.rendered_output());
            err.exit_code()
        }
        Err(err) => {
            let cached = interp.cached_source(input).map(str::to_string);
            eprintln!("{}", err.render_with_source(cached.as_deref()));
            err.exit_code()
        }
    }
}

fn options_from(cli: &Cli, input: &Path) -> InterpreterOptions {
    let mut options = InterpreterOptions::default();
    options.strict = cli.strict;
    options.pretty = cli.pretty;
    options.format = match cli.format.as_str() {
        "xml" => OutputFormat::Xml,
        _ => OutputFormat::Markdown,
    };
    options.allow_urls = cli.allow_urls;
    options.url_timeout_ms = cli.url_timeout;
    options.url_max_size = cli.url_max_size;
    options.url_allowed_domains = split_csv(cli.url_allowed_domains.as_deref());
    options.url_blocked_domains = split_csv(cli.url_blocked_domains.as_deref());
    options.base_path = input
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    options.home_path = cli
        .home_path
        .clone()
        .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
        .or_else(|| std::env::var_os("USERPROFILE").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("/"));
    options.error_dedup_disabled =
        std::env::var("MLLD_DISABLE_ERROR_DEDUPLICATION").as_deref() == Ok("1");
    options
}

fn split_csv(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn flush_streams(interp: &Interpreter) {
    for (stream, text) in interp.stream_outputs() {
        match stream {
            OutputStream::Stdout => print!("{text}"),
            OutputStream::Stderr => eprint!("{text}"),
        }
    }
}

fn write_output(cli: &Cli, input: &Path, rendered: &str) -> Result<(), String> {
    if cli.stdout {
        print!("{rendered}");
        return Ok(());
    }
    let target = match &cli.output {
        Some(path) => path.clone(),
        None => derive_output_path(input, &cli.format),
    };
    std::fs::write(&target, rendered)
        .map_err(|e| format!("cannot write {}: {e}", target.display()))
}

fn derive_output_path(input: &Path, format: &str) -> PathBuf {
    let extension = if format == "xml" { "xml" } else { "md" };
    let mut target = input.with_extension(extension);
    if target == input {
        target = input.with_extension(format!("out.{extension}"));
    }
    target
}

fn wait_for_change(input: &Path) -> std::io::Result<()> {
    let initial = std::fs::metadata(input)?.modified()?;
    loop {
        std::thread::sleep(std::time::Duration::from_millis(500));
        let current = std::fs::metadata(input)?.modified()?;
        if current > initial {
            return Ok(());
        }
    }
}
