use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tracing::{debug, trace};
use wire_protocol::{Command, Notification};

use crate::pbx::Pbx;
use crate::tu::TelephoneUnit;

/// One client connection: registers a TU, relays commands and
/// notifications until the client goes away or the switch shuts down.
pub(crate) async fn run(pbx: Arc<Pbx>, stream: TcpStream) -> anyhow::Result<()> {
    let (read, write) = stream.into_split();
    let (tx, rx) = unbounded_channel();
    let tu = match pbx.register(tx) {
        Ok(tu) => tu,
        Err(e) => {
            debug!("rejecting client: {e:#}");
            return Ok(());
        }
    };

    let result = manage_client(&pbx, &tu, read, write, rx).await;

    // Whatever ended the session, put the line back on hook before the
    // registry reference goes away; this is where a live pairing dissolves
    // and the peer hears about it.
    tu.hangup();
    if let Err(e) = pbx.unregister(&tu) {
        debug!("error unregistering: {e:#}");
    }
    result
}

async fn manage_client(
    pbx: &Arc<Pbx>,
    tu: &Arc<TelephoneUnit>,
    read: OwnedReadHalf,
    mut write: OwnedWriteHalf,
    mut rx: UnboundedReceiver<Notification>,
) -> anyhow::Result<()> {
    let token = pbx.cancellation_token().clone();

    let reader = async {
        let mut read = BufReader::new(read);
        let mut line = String::new();
        loop {
            line.clear();
            let n = tokio::select! {
                _ = token.cancelled() => {
                    trace!("shutting down");
                    return Ok(());
                }
                r = read.read_line(&mut line) => r.context("error reading")?,
            };
            if n == 0 {
                trace!("EOF");
                return Ok(());
            }
            match Command::parse(&line) {
                Ok(Command::Pickup) => tu.pickup(),
                Ok(Command::Hangup) => tu.hangup(),
                Ok(Command::Dial(ext)) => pbx.dial_ext(tu, ext),
                Ok(Command::Chat(text)) => {
                    if let Err(e) = tu.chat(&text) {
                        debug!("chat failed: {e:#}");
                    }
                }
                // Protocol errors don't kill the connection.
                Err(e) => trace!("ignoring line: {e:#}"),
            }
        }
    };

    let writer = async {
        let mut buf = String::new();
        while let Some(notification) = rx.recv().await {
            buf.clear();
            notification.serialize(&mut buf);
            write
                .write_all(buf.as_bytes())
                .await
                .context("error writing")?;
        }
        Ok::<_, anyhow::Error>(())
    };

    tokio::select! {
        r = reader => r,
        r = writer => r,
    }
}
