use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use fluux_stream::connector::{self, tls};
use fluux_stream::stanza::Presence;
use fluux_stream::{
    ConnectionHandler, ConnectionInfo, Packet, ResourceBindingStream, SaslPlainStream, SequentialIds,
    StreamProcessors,
};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

struct Options {
    server: Option<String>,
    jid: Option<String>,
    password: Option<String>,
    resource: Option<String>,
    config: Option<PathBuf>,
    verbose_level: Option<String>,
    log_file: Option<PathBuf>,
    dangerous_insecure_tls: bool,
}

fn flag_value(args: &[String], name: &str) -> Option<String> {
    let prefix = format!("--{}=", name);
    args.iter().find_map(|arg| arg.strip_prefix(&prefix).map(str::to_string))
}

fn parse_args(args: &[String]) -> Options {
    // --verbose / -v logs without XMPP traffic, --verbose=xmpp includes it
    let verbose_level = args.iter().find_map(|arg| {
        if arg == "--verbose" || arg == "-v" {
            Some("default".to_string())
        } else {
            arg.strip_prefix("--verbose=").map(str::to_string)
        }
    });

    Options {
        server: flag_value(args, "server"),
        jid: flag_value(args, "jid"),
        password: flag_value(args, "password"),
        resource: flag_value(args, "resource"),
        config: flag_value(args, "config").map(PathBuf::from),
        verbose_level,
        log_file: flag_value(args, "log-file").map(PathBuf::from),
        dangerous_insecure_tls: args.iter().any(|arg| arg == "--dangerous-insecure-tls"),
    }
}

fn print_help() {
    eprintln!("fluux-stream v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: fluux-stream --jid=USER@DOMAIN [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("      --jid=JID         Account to connect as (user@domain[/resource])");
    eprintln!("      --password=PASS   Authenticate with SASL PLAIN");
    eprintln!("      --server=ADDR     tls://host:port, tcp://host:port or host:port (default: SRV lookup)");
    eprintln!("      --resource=RES    Resource to request when binding");
    eprintln!("      --config=PATH     Read connection settings from a JSON file");
    eprintln!("  -v, --verbose         Enable verbose logging to stderr (no XMPP traffic)");
    eprintln!("      --verbose=xmpp    Enable verbose logging including XMPP packet content");
    eprintln!("      --log-file=PATH   Override log file directory (default: platform log dir)");
    eprintln!("      --dangerous-insecure-tls");
    eprintln!("                        Disable TLS certificate verification (INSECURE!)");
    eprintln!("  -h, --help            Show this help message");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  RUST_LOG              Override log filter (e.g. RUST_LOG=debug)");
}

fn default_log_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("com.processone.fluux-stream").join("logs")
}

/// Daily-rotating log file always, stderr when verbose or `RUST_LOG` is set.
fn init_logging(log_dir: &Path, verbose_level: Option<&str>) -> WorkerGuard {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
    }
    let env_override = std::env::var("RUST_LOG").is_ok();

    let file_filter = if env_override {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("fluux_stream=info,info")
    };
    let file_appender = tracing_appender::rolling::daily(log_dir, "fluux-stream.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);

    let stderr_layer = if verbose_level.is_some() || env_override {
        let stderr_filter = if env_override {
            EnvFilter::from_default_env()
        } else if verbose_level == Some("xmpp") {
            EnvFilter::new("fluux_stream=debug,info")
        } else {
            EnvFilter::new("fluux_stream=info,fluux_stream::framing=info,info")
        };
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();
    guard
}

fn connection_info(options: &Options) -> fluux_stream::Result<ConnectionInfo> {
    let mut info = match &options.config {
        Some(path) => ConnectionInfo::load(path)?,
        None => ConnectionInfo::default(),
    };
    if let Some(jid) = &options.jid {
        info.set_jid(jid)?;
    }
    if options.server.is_some() {
        info.server = options.server.clone();
    }
    if options.password.is_some() {
        info.password = options.password.clone();
    }
    if options.resource.is_some() {
        info.resource = options.resource.clone();
    }
    info.dangerous_insecure_tls |= options.dangerous_insecure_tls;
    info.validate()?;
    Ok(info)
}

async fn run(info: ConnectionInfo) -> fluux_stream::Result<()> {
    let handler = ConnectionHandler::new(StreamProcessors::default(), Arc::new(SequentialIds::new("fluux")));
    handler.add_listener(Arc::new(|packet: &Packet| {
        info!(kind = ?packet.kind(), id = ?packet.id(), from = ?packet.sender(), "Received packet");
    }));

    let mut task = connector::connect(&handler, &info).await?;

    let online = async {
        if info.password.is_some() {
            handler.process_stream(&SaslPlainStream, true).await?;
        }
        handler.process_stream(&ResourceBindingStream, false).await?;
        handler.queue_packet(Packet::from(Presence::available()), false).await?;
        Ok::<_, fluux_stream::Error>(())
    };
    if let Err(e) = online.await {
        handler.shutdown();
        let _ = task.await;
        return Err(e);
    }
    let session = handler.session().await;
    info!(jid = ?session.jid, secure = session.secure, "Online");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, closing stream");
            handler.shutdown();
            let _ = task.await;
        }
        _ = &mut task => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_help();
        return ExitCode::SUCCESS;
    }
    let options = parse_args(&args);

    let info = match connection_info(&options) {
        Ok(info) => info,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Run with --help for usage.");
            return ExitCode::from(2);
        }
    };

    tls::set_dangerous_insecure_tls(info.dangerous_insecure_tls);
    if info.dangerous_insecure_tls {
        eprintln!("WARNING: TLS certificate verification is DISABLED (--dangerous-insecure-tls)");
        eprintln!("         This is insecure and should only be used for development/testing.");
    }

    let log_dir = match &options.log_file {
        Some(path) => path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(".")),
        None => default_log_dir(),
    };
    let _log_guard = init_logging(&log_dir, options.verbose_level.as_deref());
    eprintln!("Log file: {}", log_dir.display());

    match run(info).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Connection failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
