use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use clamd_client::{
    clamav::{ClamAVClient, ClamAVClientImpl, ScanResult, ScanVerdict},
    config::ClientConfig,
    error::{Error, Result},
};

#[derive(Debug)]
pub struct Args {
    config_path: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    log_level: String,
    action: Action,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Ping,
    Version,
    Stats,
    Reload,
    Scan(String),
    MultiScan(String),
    ContScan(String),
    AllMatchScan(String),
    InStream(PathBuf),
}

/// An explicit `--config` wins, then `--host`/`--port`, then the first
/// config file found in the default locations, then `localhost:3310`.
pub async fn load_config_from_args(args: &Args) -> Result<ClientConfig> {
    if let Some(config_path) = &args.config_path {
        info!("Loading config from: {:?}", config_path);
        return ClientConfig::load(config_path).await;
    }

    if args.host.is_some() || args.port.is_some() {
        let defaults = ClientConfig::default();
        return Ok(ClientConfig::new(
            args.host.clone().unwrap_or(defaults.host),
            args.port.unwrap_or(defaults.port),
        ));
    }

    Ok(ClientConfig::load_from_default_locations()
        .await?
        .unwrap_or_default())
}

fn report_scan(result: &ScanResult) -> u8 {
    println!("{}", result.raw());
    for infected in result.infected_files() {
        warn!(
            "Infected: {} ({})",
            infected.file_name(),
            infected.virus_name()
        );
    }

    match result.verdict() {
        ScanVerdict::Clean | ScanVerdict::Unknown => 0,
        ScanVerdict::VirusDetected => 1,
        ScanVerdict::Error => 2,
    }
}

pub async fn run(
    client: &ClamAVClientImpl,
    action: &Action,
    cancel: CancellationToken,
) -> Result<u8> {
    let cancel = Some(cancel);
    let code = match action {
        Action::Ping => {
            let alive = client.ping(cancel).await?;
            println!("{}", if alive { "PONG" } else { "no pong" });
            if alive {
                0
            } else {
                2
            }
        }
        Action::Version => {
            println!("{}", client.version(cancel).await?);
            0
        }
        Action::Stats => {
            let stats = client.stats(cancel).await?;
            println!("{:#?}", stats);
            0
        }
        Action::Reload => {
            if client.reload(cancel).await? {
                println!("RELOADING");
                0
            } else {
                2
            }
        }
        Action::Scan(path) => report_scan(&client.scan(path, cancel).await?),
        Action::MultiScan(path) => report_scan(&client.multiscan(path, cancel).await?),
        Action::ContScan(path) => report_scan(&client.contscan(path, cancel).await?),
        Action::AllMatchScan(path) => report_scan(&client.allmatchscan(path, cancel).await?),
        Action::InStream(file) => report_scan(&client.send_and_scan_file(file, cancel).await?),
    };

    Ok(code)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = parse_args();

    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("{}", e);
        return ExitCode::from(2);
    }

    match run_main(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{}", e);
            ExitCode::from(2)
        }
    }
}

async fn run_main(args: Args) -> Result<u8> {
    let config = load_config_from_args(&args).await?;
    let client = ClamAVClientImpl::new(config)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, cancelling");
            on_signal.cancel();
        }
    });

    run(&client, &args.action, cancel).await
}

fn path_arg(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name).required(true).help(help).num_args(1)
}

fn build_cli() -> Command {
    Command::new("clamd-client")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Talks to a clamd daemon over TCP")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Client configuration file (TOML)")
                .num_args(1),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .help("clamd host [default: localhost]")
                .num_args(1),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("clamd TCP port [default: 3310]")
                .value_parser(clap::value_parser!(u16))
                .num_args(1),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)")
                .default_value("info")
                .num_args(1),
        )
        .subcommand(Command::new("ping").about("Check that the daemon answers"))
        .subcommand(Command::new("version").about("Print the daemon version"))
        .subcommand(Command::new("stats").about("Print daemon statistics"))
        .subcommand(Command::new("reload").about("Reload the signature database"))
        .subcommand(
            Command::new("scan")
                .about("Scan a path on the daemon host")
                .arg(path_arg("path", "Path on the daemon host")),
        )
        .subcommand(
            Command::new("multiscan")
                .about("Scan a path on the daemon host using all threads")
                .arg(path_arg("path", "Path on the daemon host")),
        )
        .subcommand(
            Command::new("contscan")
                .about("Scan a path on the daemon host, continuing after matches")
                .arg(path_arg("path", "Path on the daemon host")),
        )
        .subcommand(
            Command::new("allmatchscan")
                .about("Scan a path on the daemon host, reporting every match")
                .arg(path_arg("path", "Path on the daemon host")),
        )
        .subcommand(
            Command::new("instream")
                .about("Upload a local file and scan it")
                .arg(path_arg("file", "Local file to upload")),
        )
}

fn action_from(matches: &ArgMatches) -> Action {
    let value = |m: &ArgMatches, name: &str| -> String {
        m.get_one::<String>(name).cloned().unwrap_or_default()
    };

    match matches.subcommand() {
        Some(("version", _)) => Action::Version,
        Some(("stats", _)) => Action::Stats,
        Some(("reload", _)) => Action::Reload,
        Some(("scan", m)) => Action::Scan(value(m, "path")),
        Some(("multiscan", m)) => Action::MultiScan(value(m, "path")),
        Some(("contscan", m)) => Action::ContScan(value(m, "path")),
        Some(("allmatchscan", m)) => Action::AllMatchScan(value(m, "path")),
        Some(("instream", m)) => Action::InStream(PathBuf::from(value(m, "file"))),
        _ => Action::Ping,
    }
}

fn args_from(matches: &ArgMatches) -> Args {
    Args {
        config_path: matches.get_one::<String>("config").map(PathBuf::from),
        host: matches.get_one::<String>("host").cloned(),
        port: matches.get_one::<u16>("port").copied(),
        log_level: matches
            .get_one::<String>("log-level")
            .cloned()
            .unwrap_or_else(|| "info".to_string()),
        action: action_from(matches),
    }
}

fn parse_args() -> Args {
    args_from(&build_cli().get_matches())
}

fn parse_level(log_level: &str) -> Result<Level> {
    match log_level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(Error::Config(format!("Invalid log level: {}", log_level))),
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let level = parse_level(log_level)?;

    let directive = format!("clamd_client={}", level)
        .parse()
        .map_err(|e| Error::Config(format!("Invalid log directive: {}", e)))?;
    let env_filter = EnvFilter::from_default_env().add_directive(directive);

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(env_filter)
        .init();

    Ok(())
}
