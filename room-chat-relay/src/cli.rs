use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, accepting TCP connections.
    Server(ServerArgs),
    /// Connect to a relay server and chat in a room.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = crate::server::DEFAULT_LISTEN)]
    pub listen: SocketAddr,

    /// Directory that received files are written into.
    #[arg(long, default_value = ".")]
    pub storage_dir: PathBuf,

    /// Keep at most this many history lines per room (unbounded when omitted).
    #[arg(long)]
    pub history_limit: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Name shown to other members of the room.
    #[arg(long)]
    pub username: String,

    /// Room to join after connecting.
    #[arg(long)]
    pub room: String,

    /// Address of the relay server.
    #[arg(long, default_value = crate::server::DEFAULT_LISTEN)]
    pub server: SocketAddr,
}
