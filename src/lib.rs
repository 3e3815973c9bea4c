use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use clap::Parser;
use futures::channel::mpsc::channel;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::console::run_console;
use crate::device::btle::BtleTransport;
use crate::device::constants::MIN_LINGER_TIMEOUT;
use crate::device::controller::spawn_session_controller;
use crate::device::types::TransportEvent;
use crate::error::AppRunError;

pub mod bus;
pub mod config;
pub mod console;
pub mod device;
pub mod error;
pub mod heading;

/**
 * Installs the logger. Records are filtered by the global max level only, so that the level can be
 * changed later with `set_log_level`, once the config file has been read.
 */
pub fn init_logging(level: log::LevelFilter) -> Result<(), AppRunError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Trace)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        let file = fern::log_file(log_file).map_err(|source| AppRunError::LogFile { source })?;
        dispatch = dispatch.chain(file);
    }

    dispatch.apply()?;
    set_log_level(level);
    Ok(())
}

pub fn set_log_level(level: log::LevelFilter) {
    log::set_max_level(level);
}

/// Connects to a head tracking headset and prints its status and heading.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    /// Config file to use instead of the default location
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Milliseconds without headset data before the session is reported as lingering
    #[arg(long)]
    pub linger_ms: Option<u64>,

    /// Milliseconds to scan for headsets
    #[arg(long)]
    pub scan_ms: Option<u64>,

    /// Number of heading samples to keep for replay
    #[arg(long)]
    pub replay: Option<usize>,

    /// Log at debug level
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Flags take precedence over the config file.
    pub fn apply(&self, config: &mut Config) {
        if let Some(linger_ms) = self.linger_ms {
            config.linger_timeout_ms = linger_ms;
        }
        if let Some(scan_ms) = self.scan_ms {
            config.scan_window_ms = scan_ms;
        }
        if let Some(replay) = self.replay {
            config.heading_replay_capacity = replay;
        }
        if self.verbose {
            config.log_level = String::from("debug");
        }
    }
}

async fn run_session(config: Config) -> Result<(), AppRunError> {
    let cancel = CancellationToken::new();
    let (event_sender, event_receiver) = channel::<TransportEvent>(64);

    let transport = BtleTransport::new(cancel.clone(), &config, event_sender).await?;
    let (handle, controller) = spawn_session_controller(cancel.clone(), transport, event_receiver, &config);

    let result = tokio::select! {
        result = run_console(handle.clone(), cancel.clone()) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            Ok(())
        },
    };

    // the controller may already be gone, in which case there is nothing left to shut down
    let _ = handle.shutdown().await;
    if let Err(err) = controller.await {
        error!("Session controller failed: {:?}", err);
    }
    cancel.cancel();

    result?;
    Ok(())
}

pub fn run<I, T>(args: I) -> Result<(), AppRunError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    init_logging(log::LevelFilter::Info)?;

    // only one process may drive the headset
    let config_io = ConfigIO::open_sync(cli.config.as_deref())?;
    let mut locker = config_io.locker()?;
    let _guard = locker.lock()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|source| AppRunError::Runtime { source })?;

    runtime.block_on(async move {
        let mut config = config_io.read().await?;
        cli.apply(&mut config);

        set_log_level(config.log_level_filter());
        info!(concat!("headset-link ", env!("CARGO_PKG_VERSION")));
        if config.linger_timeout_ms < MIN_LINGER_TIMEOUT {
            warn!("Linger timeout of {}ms is too short, using {}ms", config.linger_timeout_ms, MIN_LINGER_TIMEOUT);
        }

        run_session(config).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from(["headset-link", "--linger-ms", "250", "--replay", "16", "-v"]);
        let mut config = Config::default();
        cli.apply(&mut config);

        assert_eq!(config.linger_timeout_ms, 250);
        assert_eq!(config.heading_replay_capacity, 16);
        assert_eq!(config.scan_window_ms, Config::default().scan_window_ms);
        assert_eq!(config.log_level_filter(), log::LevelFilter::Debug);
    }

    #[test]
    fn log_level_can_change_after_init() {
        init_logging(log::LevelFilter::Info).unwrap();
        assert_eq!(log::max_level(), log::LevelFilter::Info);

        set_log_level(log::LevelFilter::Debug);
        assert_eq!(log::max_level(), log::LevelFilter::Debug);
        assert!(log::log_enabled!(log::Level::Debug));
    }
}
