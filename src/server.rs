//! The protocol engine's runtime: the accept loop and per-connection
//! command dispatch, as library functions parameterized over a shared
//! [`Coordinator`] rather than process-global state.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::sink::SinkExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio_stream::StreamExt;
use tracing::{debug, instrument, warn, Level};

use crate::coordinator::{Coordinator, Session};
use crate::error::CommandError;
use crate::wire::events::ClientEvent;
use crate::wire::protocol::{Command, Response};
use crate::wire::{self, decoder};

/// Consecutive malformed frames tolerated before a connection is dropped.
const MAX_CONSECUTIVE_BAD_FRAMES: u32 = 3;

/// Accepts connections until the coordinator's cancellation token fires,
/// spawning one task per connection.
pub async fn accept_loop(coordinator: Arc<Coordinator>, listener: TcpListener) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "listening");

    loop {
        match select! {
            accept = listener.accept() => accept,
            _ = coordinator.cancel.cancelled() => return Ok(()),
        } {
            Ok((conn, _)) => {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move {
                    if let Err(error) = handle_connection(coordinator, conn).await {
                        warn!(%error, "connection ended with an error");
                    }
                });
            },
            Err(error) => {
                warn!(%error, "failed to accept connection");
                continue;
            },
        }
    }
}

#[instrument(name = "client_loop", err(level = Level::WARN), fields(peer = %conn.peer_addr()?), skip_all)]
async fn handle_connection(coordinator: Arc<Coordinator>, conn: TcpStream) -> Result<()> {
    conn.set_nodelay(true).context("setting NODELAY")?;
    coordinator.connection_opened();
    debug!("accepted connection");

    let result = serve(&coordinator, conn).await;

    coordinator.connection_closed();
    result
}

async fn serve(coordinator: &Arc<Coordinator>, conn: TcpStream) -> Result<()> {
    let mut framed = wire::framed(conn);
    let mut session = Session::new();
    let mut bad_frames = 0u32;

    let hi = coordinator.greeting(&session);
    let hi_json = serde_json::to_string(&hi).context("serializing HI greeting")?;
    framed.send(Response::simple(format!("HI {hi_json}"))).await?;

    let outcome: Result<()> = loop {
        let evt = select! {
            x = framed.next() => match x {
                None => {
                    debug!("connection dropped");
                    break Ok(());
                },
                Some(r) => r,
            },
            _ = coordinator.cancel.cancelled() => break Ok(()),
        };

        let evt = match evt {
            Ok(e) => e,
            Err(decoder::Error::Io(e)) => break Err(e.into()),
            Err(decoder::Error::Client(resp)) => {
                framed.send(resp).await?;
                bad_frames += 1;
                if bad_frames >= MAX_CONSECUTIVE_BAD_FRAMES {
                    break Err(anyhow!("too many malformed frames; disconnecting client"));
                }
                continue;
            },
        };

        let cmd = match evt {
            ClientEvent::Command(cmd) => {
                bad_frames = 0;
                cmd
            },
            ClientEvent::Rejected(err) => {
                framed.send(Response::from(err)).await?;
                continue;
            },
        };

        coordinator.record_command();

        if !session.identified && !matches!(cmd, Command::Hello(_)) {
            framed.send(Response::error("ERR", "Not identified")).await?;
            continue;
        }

        let is_end = matches!(cmd, Command::End);
        match dispatch(coordinator, &mut session, cmd).await {
            Ok(resp) => {
                framed.send(resp).await?;
                if is_end {
                    break Ok(());
                }
            },
            Err(CommandError::Auth(message)) => {
                framed.send(Response::error("ERR", message)).await?;
                break Ok(());
            },
            Err(e) => {
                framed.send(Response::from(e)).await?;
            },
        }
    };

    framed.into_inner().shutdown().await.context("during shutdown")?;
    outcome
}

async fn dispatch(
    coordinator: &Coordinator,
    session: &mut Session,
    cmd: Command,
) -> Result<Response, CommandError> {
    match cmd {
        Command::Hello(args) => coordinator.hello(session, args),
        Command::Push(job) => coordinator.push(*job),
        Command::Fetch(queues) => coordinator.fetch(session, queues).await,
        Command::Ack { jid } => coordinator.ack(session, &jid),
        Command::Fail(args) => coordinator.fail(session, args),
        Command::Beat { wid } => coordinator.beat(&wid),
        Command::Info => coordinator.info(),
        Command::Flush => coordinator.flush(),
        Command::End => Ok(Response::ok()),
    }
}
