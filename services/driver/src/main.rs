// conduit-driver: the media driver daemon.

use clap::{Arg, ArgAction, Command};
use conduit_driver::{config, MediaDriver, ThreadingMode};
use tracing::{error, info};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "conduit driver starting");

    let matches = Command::new("conduit-driver")
        .version(env!("CARGO_PKG_VERSION"))
        .about("UDP/IPC messaging media driver")
        .arg(
            Arg::new("dir")
                .help("Base directory for cnc.dat and log buffer files")
                .long("dir")
                .value_name("path"),
        )
        .arg(
            Arg::new("config")
                .help("Path to a TOML configuration file")
                .short('c')
                .long("config")
                .value_name("path"),
        )
        .arg(
            Arg::new("threading_mode")
                .help("Agent threading mode")
                .long("threading-mode")
                .value_parser(["dedicated", "shared", "shared-network", "invoker"]),
        )
        .arg(
            Arg::new("driver_timeout")
                .help("Driver liveness timeout in milliseconds")
                .long("driver-timeout")
                .value_name("ms")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("print_configuration")
                .help("Print the resolved configuration as JSON at startup")
                .long("print-configuration")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(std::path::PathBuf::from);
    let mut config = match config::load_config(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    if let Some(dir) = matches.get_one::<String>("dir") {
        config.dir = std::path::PathBuf::from(dir);
    }
    if let Some(mode) = matches.get_one::<String>("threading_mode") {
        config.threading_mode = ThreadingMode::parse(mode).expect("validated by clap");
    }
    if let Some(timeout) = matches.get_one::<i64>("driver_timeout") {
        config.driver_timeout_ms = *timeout;
    }
    if matches.get_flag("print_configuration") {
        config.print_configuration = true;
    }

    if config.print_configuration {
        match serde_json::to_string_pretty(&config) {
            Ok(json) => println!("{json}"),
            Err(e) => error!(error = %e, "could not serialize configuration"),
        }
    }

    if config.threading_mode == ThreadingMode::Invoker {
        eprintln!("FATAL: invoker mode requires embedding the driver in a host application");
        std::process::exit(1);
    }

    let driver = match MediaDriver::launch(config) {
        Ok(driver) => driver,
        Err(e) => {
            eprintln!("FATAL: failed to launch driver: {e}");
            std::process::exit(1);
        }
    };

    install_signal_handler();

    // Park until a signal or a validated TerminateDriver command arrives.
    while !driver.is_terminated() && !signal_received() {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    info!("shutting down");
    driver.shutdown();
}

// ---------------------------------------------------------------------------
// Graceful shutdown signal
// ---------------------------------------------------------------------------

static SIGNALLED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SIGNALLED.store(true, std::sync::atomic::Ordering::Release);
}

fn install_signal_handler() {
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
}

fn signal_received() -> bool {
    SIGNALLED.load(std::sync::atomic::Ordering::Acquire)
}
