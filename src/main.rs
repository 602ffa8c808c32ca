//! Table Capture - Main entry point
//!
//! Captures a window (or the full display) on an interval, extracts the
//! visible table rows, scrolls with key presses and writes a deduplicated CSV
//! when stopped with Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! # Prompt for columns, capture the full display
//! table-capture
//!
//! # Capture a specific window with predefined columns
//! table-capture --window "Sales Navigator" --column "Person Name" --column "Job Title"
//!
//! # Keep the raw rows and confirm deduplication at the end
//! table-capture --debug --output leads.csv
//! ```

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use table_capture::capture::{select_window, WindowMatcher};
use table_capture::{
    list_windows, spawn_observer, write_csv, CaptureService, CaptureTarget, Config, ConfigError,
    ConfigSource, ConsoleReviewer, FrameArchive, FrameBus, KeystrokeNavigator, MistralExtractor,
    NavKey, Navigator, NoopNavigator, PreviewWriter, Session, SessionError, StopSignal,
};
use table_capture::navigator::{exact_title_regex, selector_regex};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Command line options; anything unset falls back to the config file
#[derive(Debug, Default, Clone, PartialEq)]
struct CliArgs {
    help: bool,
    version: bool,
    config_path: Option<PathBuf>,
    save_config: bool,
    output: Option<PathBuf>,
    columns: Vec<String>,
    window: Option<String>,
    list_windows: bool,
    interval: Option<f64>,
    settle: Option<f64>,
    steps: Option<u32>,
    api_key: Option<String>,
    debug: bool,
    no_preview: bool,
}

impl CliArgs {
    /// Overlay the flags onto a loaded config
    fn apply(&self, config: &mut Config) {
        if let Some(output) = &self.output {
            config.session.output_path = output.clone();
        }
        if !self.columns.is_empty() {
            config.session.columns = self.columns.clone();
        }
        if let Some(window) = &self.window {
            config.capture.window = Some(window.clone());
        }
        if let Some(interval) = self.interval {
            config.session.capture_interval_seconds = interval;
        }
        if let Some(settle) = self.settle {
            config.session.settle_delay_seconds = settle;
        }
        if let Some(steps) = self.steps {
            config.session.navigation_steps = steps;
        }
        if let Some(key) = &self.api_key {
            config.extractor.api_key = Some(key.clone());
        }
        if self.debug {
            config.session.debug_mode = true;
        }
        if self.no_preview {
            config.session.preview_enabled = false;
        }
    }
}

fn value_for<'a>(flag: &str, iter: &mut impl Iterator<Item = &'a String>) -> Result<&'a String, String> {
    iter.next().ok_or_else(|| format!("{} requires a value", flag))
}

fn number_for<'a, T: std::str::FromStr>(
    flag: &str,
    iter: &mut impl Iterator<Item = &'a String>,
) -> Result<T, String> {
    let value = value_for(flag, iter)?;
    value
        .parse()
        .map_err(|_| format!("Invalid value for {}: {}", flag, value))
}

/// Parse command line arguments (without the program name)
fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut cli = CliArgs::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => cli.help = true,
            "--version" | "-v" => cli.version = true,
            "--config" | "-c" => cli.config_path = Some(PathBuf::from(value_for(arg, &mut iter)?)),
            "--save-config" => cli.save_config = true,
            "--output" | "-o" => cli.output = Some(PathBuf::from(value_for(arg, &mut iter)?)),
            "--column" => cli.columns.push(value_for(arg, &mut iter)?.clone()),
            "--window" | "-w" => cli.window = Some(value_for(arg, &mut iter)?.clone()),
            "--list-windows" => cli.list_windows = true,
            "--interval" => cli.interval = Some(number_for(arg, &mut iter)?),
            "--settle" => cli.settle = Some(number_for(arg, &mut iter)?),
            "--steps" => cli.steps = Some(number_for(arg, &mut iter)?),
            "--api-key" => cli.api_key = Some(value_for(arg, &mut iter)?.clone()),
            "--debug" => cli.debug = true,
            "--no-preview" => cli.no_preview = true,
            other => return Err(format!("Unknown argument: {}", other)),
        }
    }

    Ok(cli)
}

fn print_help() {
    println!(
        r#"Table Capture - screen table extraction to CSV

USAGE:
    table-capture [OPTIONS]

OPTIONS:
    -h, --help              Show this help message
    -v, --version           Show version
    -c, --config <PATH>     Path to configuration file
    --save-config           Write the effective settings (including prompted columns) to the config file
    -o, --output <PATH>     CSV output path (default: screen_capture_table.csv)
    --column <NAME>         Output column, repeat for each column (prompted if none)
    -w, --window <NAME>     Capture the window whose title or app matches (substring or glob)
    --list-windows          List capturable windows and exit
    --interval <SECS>       Time between captures (default: 10)
    --settle <SECS>         Wait after scrolling before the next capture (default: 5)
    --steps <N>             Key presses sent per cycle (default: 11)
    --api-key <KEY>         Mistral API key (default: $MISTRAL_API_KEY)
    --debug                 Keep the raw rows and confirm deduplication at the end
    --no-preview            Do not write the preview image

Press Ctrl+C to stop capturing. Rows are deduplicated and written on exit.

ENVIRONMENT:
    MISTRAL_API_KEY         API key for OCR and structuring
    RUST_LOG                Log filter (overrides general.log_level)
"#
    );
}

/// Read column names one per line until an empty line
fn read_columns<R: BufRead, W: Write>(mut input: R, mut output: W) -> std::io::Result<Vec<String>> {
    writeln!(output, "What data points do you want to extract from the tables?")?;
    writeln!(output, "Enter each column header (press Enter on an empty line when done):")?;

    let mut columns: Vec<String> = Vec::new();
    loop {
        write!(output, "Column {}: ", columns.len() + 1)?;
        output.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            break;
        }

        let column = line.trim();
        if column.is_empty() {
            if columns.is_empty() {
                writeln!(output, "Please enter at least one column header.")?;
                continue;
            }
            break;
        }
        columns.push(column.to_string());
    }

    Ok(columns)
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn print_windows() -> ExitCode {
    match list_windows() {
        Ok(windows) => {
            println!("{:>8}  {:<24}  TITLE", "ID", "APP");
            for w in windows {
                println!(
                    "{:>8}  {:<24}  {} ({}x{}){}",
                    w.id,
                    w.app_name,
                    w.title,
                    w.width,
                    w.height,
                    if w.is_minimized { " [minimized]" } else { "" }
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to list windows: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Name handed to the keystroke backend so the target gets focus first
///
/// Both backends use the window picked by the capture selector: AppleScript
/// activates its application, xdotool searches for its exact title. If no
/// window resolves, xdotool falls back to the selector translated to a regex.
fn activation_name(target: &CaptureTarget) -> Option<String> {
    let CaptureTarget::Window(selector) = target else {
        return None;
    };

    let resolved = match list_windows() {
        Ok(windows) => select_window(&WindowMatcher::new(selector), &windows).cloned(),
        Err(e) => {
            warn!("Cannot resolve window for {}: {}", target, e);
            None
        }
    };

    if cfg!(target_os = "macos") {
        resolved.map(|w| w.app_name)
    } else {
        Some(match resolved {
            Some(w) => exact_title_regex(&w.title),
            None => selector_regex(selector),
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("Use --help for usage information.");
            return ExitCode::FAILURE;
        }
    };

    if cli.help {
        print_help();
        return ExitCode::SUCCESS;
    }
    if cli.version {
        println!("Table Capture v{}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let (mut config, source) = match &cli.config_path {
        Some(path) => match Config::load_strict(path.clone()) {
            Ok(config) => (config, ConfigSource::File(path.clone())),
            Err(e) => {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        },
        None => Config::load(),
    };

    init_logging(&config.general.log_level);
    source.log();

    if cli.list_windows {
        return print_windows();
    }

    cli.apply(&mut config);

    if config.session.columns.is_empty() {
        let stdin = std::io::stdin();
        match read_columns(stdin.lock(), std::io::stdout()) {
            Ok(columns) => config.session.columns = columns,
            Err(e) => {
                error!("Failed to read columns: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    let plan = match config.plan() {
        Ok(plan) => plan,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    if cli.save_config {
        let path = cli
            .config_path
            .clone()
            .unwrap_or_else(Config::default_config_path);
        if let Err(e) = config.save_to_path(&path) {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    }

    let Some(api_key) = config.extractor.resolve_api_key() else {
        error!("{}", ConfigError::MissingApiKey);
        return ExitCode::FAILURE;
    };

    let extractor = match MistralExtractor::new(api_key, &config.extractor) {
        Ok(extractor) => extractor,
        Err(e) => {
            error!("Failed to create extractor: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let navigator: Box<dyn Navigator> = if config.navigation.enabled {
        let key = match NavKey::parse(&config.navigation.key) {
            Ok(key) => key,
            Err(e) => {
                error!("{}", e);
                return ExitCode::FAILURE;
            }
        };
        let activate = if config.navigation.activate_target {
            activation_name(&plan.target)
        } else {
            None
        };
        Box::new(KeystrokeNavigator::new(
            key,
            Duration::from_millis(config.navigation.key_delay_ms),
            activate,
        ))
    } else {
        Box::new(NoopNavigator)
    };

    // Setup shutdown signal
    let stop = StopSignal::new();
    let handler_stop = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!("\n🛑 Stopping capture...");
        handler_stop.trigger();
    }) {
        warn!("Failed to install Ctrl+C handler: {}", e);
    }

    let bus = FrameBus::default();
    let mut observers = Vec::new();
    if config.session.preview_enabled {
        info!("Preview: {}", config.session.preview_path.display());
        observers.push(spawn_observer(&bus, PreviewWriter::new(&config.session.preview_path)));
    }
    if let Some(dir) = &config.session.screenshots_dir {
        match FrameArchive::new(dir) {
            Ok(archive) => observers.push(spawn_observer(&bus, archive)),
            Err(e) => warn!("Screenshot archive disabled: {}", e),
        }
    }

    println!();
    println!("📋 Columns: {}", plan.schema);
    println!("🎯 Target: {}", plan.target);
    println!(
        "⏱️  Every {:?}, {} key presses, {:?} settle",
        plan.capture_interval, plan.navigation_steps, plan.settle_delay
    );
    println!("Press Ctrl+C to stop and save.");
    println!();

    let schema = plan.schema.clone();
    let mut session = Session::new(
        plan,
        Box::new(CaptureService::new()),
        Box::new(extractor),
        navigator,
        stop,
    )
    .with_frame_bus(bus);
    if config.session.debug_mode {
        session = session.with_reviewer(Box::new(ConsoleReviewer));
    }

    let result = session.run().await;

    for handle in observers {
        let _ = handle.await;
    }

    match result {
        Ok(report) => {
            println!();
            println!("{}", report);
            if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(SessionError::SinkWrite { source, buffer }) => {
            error!("{}", source);
            let rescue = std::env::temp_dir().join(format!(
                "table-capture-rescue-{}.csv",
                chrono::Local::now().format("%Y%m%d_%H%M%S")
            ));
            match write_csv(&rescue, &schema, &buffer) {
                Ok(()) => warn!("Saved {} unwritten rows to {}", buffer.len(), rescue.display()),
                Err(e) => error!("Rescue write failed too, {} rows lost: {}", buffer.len(), e),
            }
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
