//! Thin accept loop: binds a listening socket, and for every client that
//! connects spawns a `ClientNode` and hands it the connection. Daemon
//! bootstrap proper — modules, sandbox checks, suspend-on-idle, concrete
//! V4L2/Xv nodes — lives outside this core and is not implemented here.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::Parser;
use log::{error, info, warn, LevelFilter};
use serde::Deserialize;

use client_node::{ClientNode, Collaborators, SharedClientNode, Subscription};
use spa_support::EventLoop;

#[derive(Debug, thiserror::Error)]
enum Error {
    Io(#[from] std::io::Error),
    Json(#[from] serde_json::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Unix seqpacket socket to listen on.
    socket_path: PathBuf,

    /// Optional JSON config file; unset knobs fall back to `Config::default`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Repeatable: -v for debug, -vv for trace. Default is info.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// The few knobs that matter at this layer; everything else (ring depth,
/// buffer slot counts) is fixed by `client-node` itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct Config {
    max_input_ports: u32,
    max_output_ports: u32,
    listen_backlog: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_input_ports: 8,
            max_output_ports: 8,
            listen_backlog: 16,
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config, Error> {
    match path {
        Some(p) => Ok(serde_json::from_str(&std::fs::read_to_string(p)?)?),
        None => Ok(Config::default()),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).parse_default_env().init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = match load_config(args.config.as_deref()) {
        Ok(c) => c,
        Err(err) => {
            error!("failed to load config: {err}");
            std::process::exit(1);
        }
    };
    info!("starting with config {config:?}");

    let main_loop = EventLoop::new("main").expect("failed to start main loop");
    let data_loop = EventLoop::new("data").expect("failed to start data loop");

    if args.socket_path.exists() {
        if let Err(err) = std::fs::remove_file(&args.socket_path) {
            warn!("failed to remove stale socket {}: {err}", args.socket_path.display());
        }
    }
    let listener = match client_rpc::Listener::bind(&args.socket_path, config.listen_backlog) {
        Ok(l) => l,
        Err(err) => {
            error!("failed to bind {}: {err}", args.socket_path.display());
            std::process::exit(1);
        }
    };
    info!("listening on {}", args.socket_path.display());

    // `ClientNode` only hands out weak references to its own collaborator
    // subscriptions and to the tasks it spawns, so something has to hold the
    // strong `Arc` for as long as the client is around. This registry is
    // that holder; each node's own destroy signal is what evicts it.
    let live: Live = Arc::new(Mutex::new(Vec::new()));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let connection = match accepted {
                    Ok(c) => c,
                    Err(err) => {
                        error!("accept failed: {err}");
                        continue;
                    }
                };
                info!("client connected");

                let collaborators = Collaborators::default();
                let node = ClientNode::new(
                    main_loop.clone(),
                    data_loop.clone(),
                    config.max_input_ports,
                    config.max_output_ports,
                    &collaborators,
                );
                node.lock().unwrap().bind_resource(connection);
                collaborators.node_initialized.emit(&());
                retain_until_destroyed(&live, node);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                let _ = std::fs::remove_file(&args.socket_path);
                break;
            }
        }
    }
}

type Live = Arc<Mutex<Vec<(SharedClientNode, Subscription<()>)>>>;

fn retain_until_destroyed(live: &Live, node: SharedClientNode) {
    let weak = Arc::downgrade(&node);
    let live_for_sub = live.clone();
    let sub = node.lock().unwrap().subscribe_destroy(move |_| {
        if let Some(node) = weak.upgrade() {
            live_for_sub.lock().unwrap().retain(|(n, _)| !Arc::ptr_eq(n, &node));
        }
    });
    live.lock().unwrap().push((node, sub));
}
