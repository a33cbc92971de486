use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::server::{DEFAULT_QUEUE_CAPACITY, ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the room chat server, accepting WebSocket connections on /ws.
    Serve(ServeArgs),
    /// Connect to a server and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:3000")]
    pub listen: SocketAddr,

    /// Frames buffered per connection before new ones are dropped.
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY, value_parser = parse_capacity)]
    pub queue_capacity: usize,

    /// Append a JSON line per delivered action to this file.
    #[arg(long)]
    pub audit_log: Option<PathBuf>,
}

impl From<ServeArgs> for ServerConfig {
    fn from(args: ServeArgs) -> Self {
        ServerConfig {
            listen: args.listen,
            queue_capacity: args.queue_capacity,
            audit_log: args.audit_log,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// User id presented to the server.
    #[arg(long)]
    pub user: String,

    /// Address of the server to connect to.
    #[arg(long, default_value = "127.0.0.1:3000")]
    pub server: SocketAddr,
}

fn parse_capacity(raw: &str) -> Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(0) => Err("queue capacity must be at least 1".to_string()),
        Ok(capacity) => Ok(capacity),
        Err(err) => Err(err.to_string()),
    }
}
