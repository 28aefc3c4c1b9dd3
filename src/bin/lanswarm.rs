//! lanswarm operator console
//!
//! Joins the swarm, then reads one command per line from stdin:
//!
//! ```text
//! list                        torrents advertised by other peers
//! local                       torrents held here
//! peers                       known peers
//! files <id>                  files of a torrent
//! torrent_request <id> [dir]  fetch a torrent's descriptor
//! download <id> [file]        download a file, or every file
//! status                      running downloads
//! gen <id> <paths...>         share local files as a new torrent
//! end                         leave the swarm
//! ```

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;
use lanswarm::{SwarmConfig, SwarmEngine};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Descriptor files to share instead of the contents of the torrents directory
    descriptors: Vec<PathBuf>,

    /// JSON configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Multicast group
    #[arg(long)]
    group: Option<Ipv4Addr>,

    /// Multicast port
    #[arg(long)]
    port: Option<u16>,

    /// Local IPv4 address to advertise and bind multicast to
    #[arg(long)]
    local_addr: Option<Ipv4Addr>,

    /// Piece and chunk size in bytes
    #[arg(long)]
    unit_size: Option<usize>,

    /// Where descriptors are kept
    #[arg(long)]
    torrents_dir: Option<PathBuf>,

    /// Default destination of fetched torrents
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn swarm_config(&self) -> Result<SwarmConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => SwarmConfig::from_json(&std::fs::read_to_string(path)?)?,
            None => SwarmConfig::default(),
        };

        if self.group.is_some() || self.port.is_some() {
            let group = self.group.unwrap_or(config.multicast_group);
            let port = self.port.unwrap_or(config.port);
            config = config.multicast(group, port);
        }
        if let Some(addr) = self.local_addr {
            config = config.local_addr(addr);
        }
        if let Some(size) = self.unit_size {
            config = config.unit_size(size);
        }
        if let Some(dir) = &self.torrents_dir {
            config = config.torrents_dir(dir);
        }
        if let Some(dir) = &self.download_dir {
            config = config.download_dir(dir);
        }
        Ok(config)
    }
}

/// Install the fmt subscriber, plus a file layer when asked for. The returned
/// guard flushes the file writer on drop.
fn init_logging(log_file: Option<&PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_writer(std::io::stderr);

    match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let name = path.file_name().map(|n| n.to_os_string()).unwrap_or_else(|| "log.txt".into());
            let appender = tracing_appender::rolling::never(dir.unwrap_or(std::path::Path::new(".")), name);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_file.as_ref());

    let config = cli.swarm_config()?;
    let engine = SwarmEngine::start_with_descriptors(config, &cli.descriptors).await?;
    println!("Joined as {}. Type a command, or 'end' to leave.", engine.local_ip());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };

        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, args)) = words.split_first() else {
            continue;
        };

        match run_command(&engine, command, args).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => eprintln!("error: {}", e),
        }
    }

    engine.shutdown().await;
    Ok(())
}

/// Execute one console command; false means leave.
async fn run_command(engine: &SwarmEngine, command: &str, args: &[&str]) -> lanswarm::Result<bool> {
    match (command, args) {
        ("end", _) => return Ok(false),
        ("list", _) => {
            let listing = engine.request_catalog_listing();
            if listing.is_empty() {
                println!("No torrents on the network yet");
            }
            for (id, torrent) in listing {
                println!(
                    "{}  {} files  {} owners",
                    id,
                    torrent.files.len(),
                    torrent.owners.len()
                );
            }
        }
        ("local", _) => {
            for entry in engine.local_catalog().await? {
                println!("{}  {} files", entry.id, entry.files.len());
            }
        }
        ("peers", _) => {
            for (peer, status) in engine.peers() {
                println!(
                    "{}  {:?}  catalog {:?}  missed {}",
                    peer, status.phase, status.catalog, status.missed_heartbeats
                );
            }
        }
        ("files", [id]) => {
            for file in engine.torrent_files(id).await? {
                println!("{}", file);
            }
        }
        ("torrent_request", [id, rest @ ..]) if rest.len() <= 1 => {
            let destination = rest.first().map(PathBuf::from);
            if engine.request_resource(id, destination).await? {
                println!("Fetching descriptor of '{}'", id);
            } else {
                println!("Already fetching '{}'", id);
            }
        }
        ("download", [id, rest @ ..]) if rest.len() <= 1 => {
            let started = engine.start_download(id, rest.first().copied()).await?;
            println!("Started {} downloads", started);
        }
        ("status", _) => {
            for progress in engine.downloads().await {
                println!(
                    "{}/{}  {}/{} pieces",
                    progress.torrent, progress.file, progress.acquired, progress.total
                );
            }
        }
        ("gen", [id, paths @ ..]) if !paths.is_empty() => {
            let paths: Vec<PathBuf> = paths.iter().map(PathBuf::from).collect();
            let pieces = engine.publish_new_local_resource(id, &paths).await?;
            println!("Sharing '{}' ({} pieces)", id, pieces);
        }
        _ => println!("Unknown command: {} {}", command, args.join(" ")),
    }
    Ok(true)
}
