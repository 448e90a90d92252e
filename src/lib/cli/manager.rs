use std::sync::Arc;

use clap::Parser;

#[derive(Debug)]
struct Manager {
    clap_matches: Args,
}

#[derive(Debug, Parser)]
#[command(
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
)]
struct Args {
    /// Turns all log categories up to Debug, for more information check RUST_LOG env variable.
    #[arg(short, long, env = "MQT_VERBOSE")]
    verbose: bool,

    /// Specifies the path in witch the logs will be stored.
    #[arg(long, default_value = "./logs", env = "MQT_LOG_PATH")]
    log_path: String,

    /// Turns all log categories up to Trace to the log file, for more information check RUST_LOG env variable.
    #[arg(long, env = "MQT_ENABLE_TRACING_LEVEL_LOG_FILE")]
    enable_tracing_level_log_file: bool,

    /// Settings file, relative paths are resolved inside the user configuration folder.
    #[arg(long, default_value = "settings.json", env = "MQT_SETTINGS_FILE")]
    settings_file: String,

    /// Overrides the polling period of the settings file, in milliseconds.
    #[arg(long, value_name = "MS", env = "MQT_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// Overrides the minimum spacing between two real polls, in milliseconds.
    #[arg(long, value_name = "MS", env = "MQT_MIN_POLL_SPACING_MS")]
    min_poll_spacing_ms: Option<u64>,

    /// Disables the host CPU sampler and its global issues.
    #[arg(long, env = "MQT_DISABLE_CPU_SAMPLER")]
    disable_cpu_sampler: bool,

    /// Number of remote participants in the simulated call.
    #[arg(long, default_value = "2", env = "MQT_SIMULATED_REMOTE_CLIENTS")]
    simulated_remote_clients: usize,

    /// Stops after this many delivered ticks, runs forever when omitted.
    #[arg(long, env = "MQT_TICKS")]
    ticks: Option<u64>,
}

lazy_static! {
    static ref MANAGER: Arc<Manager> = Arc::new(Manager::new());
}

impl Manager {
    fn new() -> Self {
        Self {
            clap_matches: Args::parse(),
        }
    }
}

// Construct our manager, should be done inside main
pub fn init() {
    MANAGER.as_ref();
}

// Check if the verbosity parameter was used
pub fn is_verbose() -> bool {
    MANAGER.clap_matches.verbose
}

pub fn is_tracing() -> bool {
    MANAGER.clap_matches.enable_tracing_level_log_file
}

pub fn log_path() -> String {
    let log_path =
        std::fs::canonicalize(&MANAGER.clap_matches.log_path).unwrap_or_else(|_| {
            std::path::PathBuf::from(&MANAGER.clap_matches.log_path)
        });

    log_path.to_string_lossy().to_string()
}

pub fn settings_file() -> String {
    MANAGER.clap_matches.settings_file.clone()
}

pub fn poll_interval_ms() -> Option<u64> {
    MANAGER.clap_matches.poll_interval_ms
}

pub fn min_poll_spacing_ms() -> Option<u64> {
    MANAGER.clap_matches.min_poll_spacing_ms
}

pub fn is_cpu_sampler_disabled() -> bool {
    MANAGER.clap_matches.disable_cpu_sampler
}

pub fn simulated_remote_clients() -> usize {
    MANAGER.clap_matches.simulated_remote_clients
}

pub fn ticks() -> Option<u64> {
    MANAGER.clap_matches.ticks
}

// Return the command line used to start this application
pub fn command_line_string() -> String {
    std::env::args().collect::<Vec<String>>().join(" ")
}

// Return a clone of current Args struct
pub fn command_line() -> String {
    format!("{:#?}", MANAGER.clap_matches)
}
