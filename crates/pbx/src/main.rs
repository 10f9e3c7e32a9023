use std::{net::IpAddr, thread, time::Duration};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use libpbx::{
    ListenerOptions, Pbx, PbxOptions,
    logging::{InitLoggingOptions, init_logging},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

fn parse_port(value: &str) -> anyhow::Result<u16> {
    let port: u16 = value.parse().context("expected a port number")?;
    if port < 1024 {
        anyhow::bail!("ports below 1024 are reserved")
    }
    Ok(port)
}

#[derive(Parser)]
#[command(version, about)]
struct Opts {
    /// The TCP port to accept telephone units on.
    #[arg(short = 'p', long = "port", default_value = "3000", value_parser = parse_port, env = "PBX_PORT")]
    port: u16,

    /// What IP to listen on.
    #[arg(long = "listen-ip", default_value = "127.0.0.1", env = "PBX_LISTEN_IP")]
    listen_ip: IpAddr,

    /// How many extensions the switch hands out.
    #[arg(
        long = "max-extensions",
        default_value = "1024",
        env = "PBX_MAX_EXTENSIONS"
    )]
    max_extensions: usize,

    /// The console loglevel
    #[arg(value_enum, short = 'v', env = "PBX_LOG_LEVEL_CONSOLE")]
    log_level: Option<LogLevel>,

    /// The log filename to also write to in addition to the console.
    #[arg(long = "log-file", env = "PBX_LOG_FILE")]
    log_file: Option<String>,

    /// The value for RUST_LOG in the log file
    #[arg(
        long = "log-file-rust-log",
        default_value = "libpbx=debug,info",
        env = "PBX_LOG_FILE_RUST_LOG"
    )]
    log_file_rust_log: String,

    /// Set this flag if you want to use tokio's single threaded runtime.
    /// The main purpose is easier debugging.
    #[arg(short, long, env = "PBX_SINGLE_THREAD_RUNTIME")]
    single_thread_runtime: bool,

    /// How many threads to spawn for the executor.
    #[arg(short = 't', long, env = "PBX_RUNTIME_WORKER_THREADS")]
    worker_threads: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let mut rt_builder = match opts.single_thread_runtime {
        true => tokio::runtime::Builder::new_current_thread(),
        false => {
            let mut b = tokio::runtime::Builder::new_multi_thread();
            if let Some(t) = opts.worker_threads {
                b.worker_threads(t);
            }
            b
        }
    };
    let rt = rt_builder.enable_time().enable_io().build()?;

    let token = CancellationToken::new();
    #[cfg(not(target_os = "windows"))]
    {
        let token = token.clone();
        use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;
        let mut signals = Signals::new([SIGHUP, SIGINT, SIGTERM])?;
        thread::spawn(move || {
            let mut cancel_triggered = false;
            while let Some(sig) = signals.forever().next() {
                if cancel_triggered {
                    warn!("received signal {:?}, forcing shutdown", sig);
                    std::process::exit(1)
                }
                warn!("received signal {:?}, trying to shut down gracefully", sig);
                token.cancel();
                cancel_triggered = true;

                thread::spawn(|| {
                    thread::sleep(Duration::from_secs(5));
                    warn!("could not shutdown in time, killing myself");
                    std::process::exit(1)
                });
            }
        });
    }

    let result = rt.block_on(async_main(opts, token));
    if let Err(e) = result.as_ref() {
        error!("error running pbx: {e:?}");
    }
    rt.shutdown_timeout(Duration::from_secs(1));
    match result {
        Ok(_) => std::process::exit(0),
        Err(_) => std::process::exit(1),
    }
}

async fn async_main(opts: Opts, cancel: CancellationToken) -> anyhow::Result<()> {
    init_logging(InitLoggingOptions {
        default_rust_log_value: Some(match opts.log_level.unwrap_or(LogLevel::Info) {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }),
        log_file: opts.log_file.as_deref(),
        log_file_rust_log: Some(&opts.log_file_rust_log),
    })?;

    let pbx = Pbx::new_with_opts(PbxOptions {
        listen: Some(ListenerOptions {
            listen_addr: (opts.listen_ip, opts.port).into(),
        }),
        max_extensions: Some(opts.max_extensions),
        cancellation_token: Some(cancel.clone()),
    })
    .await
    .context("error starting the switch")?;

    cancel.cancelled().await;
    info!("shutting down, waiting for sessions to drain");
    pbx.stop().await;
    Ok(())
}
