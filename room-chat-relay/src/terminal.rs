use std::path::Path;

use anyhow::Result;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
    sync::mpsc,
};
use tracing::warn;

use crate::{
    cli::ClientArgs,
    client::{ChatClient, ClientEvent},
};

/// Line-oriented front end: stdin lines become chat, relayed lines go to
/// stdout.
///
/// `/join <room>` re-registers, `/file <path>` transfers a file and `/quit`
/// leaves.
pub async fn run(args: ClientArgs) -> Result<()> {
    let (client, mut events) = ChatClient::new(args.server, args.username);
    client.register(&args.room).await?;
    write_stdout(&format!("*** joined {} as {}", args.room, client.username())).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&client, &mut events, &mut stdin, &mut input).await?;
    client.disconnect().await;

    Ok(())
}

async fn run_client_loop(
    client: &ChatClient,
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        select! {
            event = events.recv() => {
                if !handle_event(event).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                let keep_going = handle_stdin_input(bytes_read, input, client).await?;
                input.clear();
                if !keep_going {
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

async fn handle_event(event: Option<ClientEvent>) -> Result<bool> {
    match event {
        Some(ClientEvent::Line(line)) => {
            write_stdout(&line).await?;
            Ok(true)
        }
        Some(ClientEvent::ConnectionLost) | None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    client: &ChatClient,
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

    if let Some(room) = text.strip_prefix("/join ") {
        match client.register(room).await {
            Ok(()) => {
                write_stdout(&format!("*** joined {} as {}", room.trim(), client.username()))
                    .await?
            }
            Err(err) => write_stderr(&format!("!!! {err:#}")).await?,
        }
        return Ok(true);
    }

    if let Some(path) = text.strip_prefix("/file ") {
        match client.send_file(Path::new(path.trim())).await {
            Ok(bytes) => write_stdout(&format!("*** sent {} ({bytes} bytes)", path.trim())).await?,
            Err(err) => write_stderr(&format!("!!! {err:#}")).await?,
        }
        return Ok(true);
    }

    client.send_message(text).await?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
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
