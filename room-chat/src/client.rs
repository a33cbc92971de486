use anyhow::{Context, Result};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    message::{EventKind, Notification, outgoing},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketWriter = SplitSink<Socket, Message>;
type SocketReader = SplitStream<Socket>;

/// What the terminal user is doing between lines.
struct ClientState {
    user: String,
    room: Option<String>,
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut writer, mut reader) = establish_connection(&args).await?;
    write_stdout(&format!("*** connected as {}", args.user)).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    let mut state = ClientState {
        user: args.user,
        room: None,
    };

    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut input, &mut state).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(SocketWriter, SocketReader)> {
    let url = format!("ws://{}/ws?userId={}", args.server, args.user);
    let (socket, _response) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);
    Ok(socket.split())
}

async fn run_client_loop(
    reader: &mut SocketReader,
    writer: &mut SocketWriter,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    state: &mut ClientState,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            server_message = reader.next() => {
                if !handle_server_message(server_message).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, writer, state).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_message(
    message: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
) -> Result<bool> {
    match message {
        Some(Ok(Message::Text(text))) => {
            render_server_frame(&text).await?;
            Ok(true)
        }
        Some(Ok(Message::Close(_))) | None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
        Some(Ok(_)) => Ok(true),
        Some(Err(err)) => Err(err).context("failed to read from server"),
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut SocketWriter,
    state: &mut ClientState,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    let frame = match parse_input(text, state) {
        Ok(frame) => frame,
        Err(hint) => {
            write_stderr(&format!("!!! {hint}")).await?;
            return Ok(true);
        }
    };

    writer.send(Message::Text(frame)).await?;
    Ok(true)
}

/// Turns one line of input into a wire frame, updating the current room.
fn parse_input(text: &str, state: &mut ClientState) -> Result<String, &'static str> {
    if let Some(room) = command_argument(text, "/join") {
        if room.is_empty() {
            return Err("usage: /join <room>");
        }
        state.room = Some(room.to_string());
        return Ok(outgoing::join(&state.user, room));
    }

    if let Some(room) = command_argument(text, "/leave") {
        let room = match room {
            "" => state.room.clone().ok_or("usage: /leave <room>")?,
            named => named.to_string(),
        };
        if state.room.as_deref() == Some(room.as_str()) {
            state.room = None;
        }
        return Ok(outgoing::leave(&state.user, &room));
    }

    match &state.room {
        Some(room) => Ok(outgoing::chat(text, room)),
        None => Err("join a room first with /join <room>"),
    }
}

/// `Some(argument)` when `text` is `command`, optionally followed by
/// whitespace and an argument.
fn command_argument<'a>(text: &'a str, command: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(command)?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut SocketWriter) {
    if let Err(error) = writer.close().await {
        warn!(?error, "failed to close websocket cleanly");
    }
}

async fn render_server_frame(text: &str) -> io::Result<()> {
    match serde_json::from_str::<Notification>(text) {
        Ok(Notification {
            kind: EventKind::Join | EventKind::Leave,
            content,
        }) => write_stdout(&format!("*** {content}")).await,
        Ok(Notification {
            kind: EventKind::Message,
            content,
        }) => write_stdout(&format!("> {content}")).await,
        Err(_) => write_stderr(&format!("!!! {text}")).await,
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
