use anyhow::Result;
use apphost::{
    Application, ApplicationHost, ApplicationState, BasicEnvironment, Environment, HostConfig,
    HostError, SetupContext,
};
use async_trait::async_trait;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "apphost")]
#[command(about = "Host a long-running application with a supervised shutdown")]
#[command(version)]
#[command(long_about = "Runs a sample heartbeat application under the apphost lifecycle \
supervisor. The process stops on SIGINT/SIGTERM (or after --run-for seconds), \
de-registers from discovery within its budget and gives the application the rest \
of the shutdown timeout to finish.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "apphost.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the host")]
    validate_config: bool,

    /// Print effective configuration and exit
    #[arg(long, help = "Print the effective configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Stop on our own after this many seconds
    #[arg(long, value_name = "SECS", help = "Request a stop after the given number of seconds")]
    run_for: Option<u64>,

    /// Heartbeat interval of the sample application
    #[arg(long, value_name = "MS", default_value_t = 1000, help = "Heartbeat interval in milliseconds")]
    tick_ms: u64,
}

/// Sample application: logs a heartbeat until asked to stop.
struct Heartbeat {
    interval: Duration,
}

#[async_trait]
impl Application for Heartbeat {
    async fn initialize(&self, environment: Arc<dyn Environment>) -> anyhow::Result<()> {
        info!(
            interval = ?self.interval,
            shutdown_timeout = ?environment.shutdown_timeout(),
            "Heartbeat initialized"
        );
        Ok(())
    }

    async fn run(&self, environment: Arc<dyn Environment>) -> anyhow::Result<()> {
        let shutdown = environment.shutdown();
        let mut ticker = tokio::time::interval(self.interval);
        let mut beats: u64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(
                        beats,
                        remaining = ?shutdown.remaining_time(),
                        "Heartbeat stopping"
                    );
                    return Err(HostError::Cancelled.into());
                }
                _ = ticker.tick() => {
                    beats += 1;
                    info!(beats, "Heartbeat");
                }
            }
        }
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        info!("Heartbeat disposed");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match HostConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    init_logging(&args)?;

    info!("Starting apphost v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let stop = CancellationToken::new();
    if let Some(seconds) = args.run_for {
        let stop = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            info!("Run time of {}s elapsed", seconds);
            stop.cancel();
        });
    }

    let host = ApplicationHost::builder(
        Heartbeat {
            interval: Duration::from_millis(args.tick_ms.max(1)),
        },
        |context: SetupContext| async move {
            let environment = BasicEnvironment::from_context(&context)
                .with_property("tick_source", "tokio::time::interval");
            Ok::<Arc<dyn Environment>, anyhow::Error>(Arc::new(environment))
        },
    )
    .config(config)
    .listen_os_signals(true)
    .cancellation(stop)
    .build();

    let result = host.run().await?;

    let summary = serde_json::json!({
        "application": host.id().to_string(),
        "state": result.state,
        "error": result.error.as_ref().map(|e| format!("{:#}", e.inner())),
    });
    info!("Run summary: {}", summary);

    let exit_code = match result.state {
        ApplicationState::Stopped | ApplicationState::Exited => 0,
        _ => 1,
    };
    info!("apphost exited with code: {}", exit_code);
    std::process::exit(exit_code);
}

/// Filter directives for the crate's own targets when `RUST_LOG` is unset.
///
/// Shutdown progress stays visible at the default level so a slow stop can be
/// traced; `--quiet` silences it along with everything else.
fn log_directives(args: &Args) -> String {
    let level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };
    let shutdown_level = match level {
        "debug" | "error" => level,
        _ => "info",
    };
    format!("apphost={},apphost::shutdown={}", level, shutdown_level)
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    // RUST_LOG wins over the command line flags
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_directives(args)))?;

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directives(flags: &[&str]) -> String {
        let args = Args::parse_from(std::iter::once("apphost").chain(flags.iter().copied()));
        log_directives(&args)
    }

    #[test]
    fn test_shutdown_progress_visible_by_default() {
        assert_eq!(directives(&[]), "apphost=warn,apphost::shutdown=info");
        assert_eq!(directives(&["--verbose"]), "apphost=info,apphost::shutdown=info");
    }

    #[test]
    fn test_debug_and_quiet_apply_to_shutdown() {
        assert_eq!(directives(&["--debug"]), "apphost=debug,apphost::shutdown=debug");
        assert_eq!(directives(&["--quiet"]), "apphost=error,apphost::shutdown=error");
        assert_eq!(directives(&["-d", "-q"]), "apphost=debug,apphost::shutdown=debug");
    }

    #[test]
    fn test_directives_parse_as_filter() {
        for flags in [vec![], vec!["--verbose"], vec!["--quiet"]] {
            assert!(tracing_subscriber::EnvFilter::try_new(directives(&flags)).is_ok());
        }
    }
}
