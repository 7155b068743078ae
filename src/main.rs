use clap::{Parser, Subcommand};
use log::{LevelFilter, info};
use peershare::core::events::PeerEvent;
use peershare::utils::setup_logging;
use peershare::{DirectoryServer, Node, P2PError, PeerConfig, Result, ServerConfig};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "peershare")]
#[command(about = "Peer-to-peer file sharing through a directory server")]
#[command(version)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the directory server
    Server {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Address to bind
        #[arg(short, long)]
        bind: Option<String>,
        /// JSON config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Join a directory server as a peer
    Peer {
        /// Directory server address (host:port)
        #[arg(short, long)]
        server: Option<String>,
        /// Username to register
        #[arg(short, long)]
        username: Option<String>,
        /// Directory to share files from and download into
        #[arg(short, long)]
        dir: Option<PathBuf>,
        /// First port to try for the transfer listener
        #[arg(short, long)]
        transfer_port: Option<u16>,
        /// Address other peers should dial for transfers
        #[arg(short, long)]
        advertise: Option<IpAddr>,
        /// JSON config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    match cli.command {
        Commands::Server { port, bind, config } => {
            let mut config = match config {
                Some(path) => ServerConfig::from_file(&path)?,
                None => ServerConfig::default(),
            };
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            run_server(config).await
        }
        Commands::Peer {
            server,
            username,
            dir,
            transfer_port,
            advertise,
            config,
        } => {
            let mut config = match config {
                Some(path) => PeerConfig::from_file(&path)?,
                None => PeerConfig::default(),
            };
            if let Some(server) = server {
                config.server_addr = server;
            }
            if let Some(dir) = dir {
                config.shared_dir = dir;
            }
            if let Some(port) = transfer_port {
                config.transfer_base_port = port;
            }
            if advertise.is_some() {
                config.advertise_addr = advertise;
            }
            run_peer(config, username).await
        }
    }
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let server = DirectoryServer::bind(config).await?;
    let metrics = server.metrics();

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down directory server");
        }
    }

    metrics.log_stats().await;
    Ok(())
}

async fn run_peer(config: PeerConfig, username: Option<String>) -> Result<()> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    tokio::spawn(print_events(events_rx));

    let node = Node::start(config, Arc::new(events_tx)).await?;
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    let mut candidate = username;
    loop {
        let name = match candidate.take() {
            Some(name) => name,
            None => match prompt(&mut input, "Username: ").await? {
                Some(name) => name,
                None => return node.shutdown().await,
            },
        };

        match node.session().register(&name).await {
            Ok(()) => break,
            Err(P2PError::UsernameTaken(name)) => println!("{} is taken, pick another", name),
            Err(P2PError::InvalidUsername(name)) => println!("{:?} is not a valid username", name),
            Err(e) => return Err(e),
        }
    }

    println!(
        "Registered. Transfer port {}. Commands: search <text>, results, download <file>, \
         pause, resume, cancel, status, files, quit",
        node.transfer().port()
    );

    while let Some(line) = prompt(&mut input, "> ").await? {
        let (command, arg) = match line.split_once(' ') {
            Some((command, arg)) => (command, arg.trim()),
            None => (line.as_str(), ""),
        };

        let outcome = match command {
            "search" => node.session().search(arg).await,
            "results" => {
                for file in node.session().results().await {
                    let owner = node.session().owner_of(&file).await.unwrap_or_default();
                    println!("  {} ({})", file, owner);
                }
                Ok(())
            }
            "download" => node.session().start_download(arg).await,
            "pause" => {
                node.transfer().set_paused(true);
                Ok(())
            }
            "resume" => {
                node.transfer().set_paused(false);
                Ok(())
            }
            "cancel" => {
                if !node.transfer().cancel_download().await {
                    println!("Nothing to cancel");
                }
                Ok(())
            }
            "status" => serde_json::to_string_pretty(&node.status().await)
                .map(|s| println!("{}", s))
                .map_err(P2PError::from),
            "files" => node.local_files().await.map(|files| {
                for file in files {
                    println!("  {}", file);
                }
            }),
            "quit" | "exit" => break,
            "" => Ok(()),
            other => {
                println!("Unknown command: {}", other);
                Ok(())
            }
        };

        match outcome {
            Ok(()) => {}
            Err(P2PError::ConnectionClosed) => {
                println!("Connection to the directory server is closed");
                break;
            }
            Err(e) => println!("Error: {}", e),
        }
    }

    node.shutdown().await
}

async fn prompt(input: &mut Lines<BufReader<Stdin>>, text: &str) -> Result<Option<String>> {
    use std::io::Write;
    print!("{}", text);
    let _ = std::io::stdout().flush();

    Ok(input.next_line().await?.map(|line| line.trim().to_string()))
}

async fn print_events(mut events: mpsc::UnboundedReceiver<PeerEvent>) {
    let mut last_percent = None;
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::ResultsChanged(files) if !files.is_empty() => {
                println!("Results: {}", files.join(", "));
            }
            PeerEvent::ResultsChanged(_) => {}
            PeerEvent::DownloadProgress { bytes_so_far, total }
            | PeerEvent::UploadProgress { bytes_so_far, total } => {
                let percent = if total == 0 { 100 } else { bytes_so_far * 100 / total };
                if last_percent != Some(percent) && percent % 10 == 0 {
                    println!("Transfer {}% ({}/{} bytes)", percent, bytes_so_far, total);
                }
                last_percent = Some(percent);
            }
            PeerEvent::Error(message) => println!("Error: {}", message),
            PeerEvent::Info(message) => println!("{}", message),
        }
    }
}
