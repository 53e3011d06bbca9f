//! WebSocket sockets for the resilient transport.
//!
//! Each socket is a `spawn_local` task that owns the tungstenite stream. The
//! [`WsSocket`] handle only queues outbound commands, so the transport can
//! send and close from inside its own callbacks without blocking. Events
//! reach the transport from the task, never from inside [`SocketFactory::open`].

use std::cell::Cell;

use futures_util::{SinkExt, StreamExt};
use kiip_core::{Socket, SocketEvent, SocketEvents, SocketFactory};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::{connect_async, tungstenite::Message};

enum Outbound {
    Frame(String),
    Close,
}

/// Opens tokio-tungstenite client sockets.
///
/// Must be used inside a `LocalSet`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsSocketFactory;

impl SocketFactory for WsSocketFactory {
    fn open(&self, url: &str, events: SocketEvents) -> Box<dyn Socket> {
        let (outbound, commands) = mpsc::unbounded_channel();
        tokio::task::spawn_local(run(url.to_owned(), commands, events));
        Box::new(WsSocket { outbound, closed: Cell::new(false) })
    }
}

/// Handle to a socket task.
///
/// Dropping the handle closes the socket.
#[derive(Debug)]
pub struct WsSocket {
    outbound: UnboundedSender<Outbound>,
    closed: Cell<bool>,
}

impl Socket for WsSocket {
    fn send(&self, frame: &str) {
        if self.closed.get() {
            return;
        }
        if self.outbound.send(Outbound::Frame(frame.to_owned())).is_err() {
            tracing::debug!("socket task finished; frame dropped");
        }
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        // The task may already be gone, which is the same outcome.
        let _ = self.outbound.send(Outbound::Close);
    }
}

async fn run(url: String, mut commands: UnboundedReceiver<Outbound>, events: SocketEvents) {
    let connected = tokio::select! {
        result = connect_async(url.as_str()) => result,
        () = closed_while_connecting(&mut commands) => {
            tracing::debug!(%url, "socket closed before opening");
            events(SocketEvent::Close);
            return;
        }
    };

    let stream = match connected {
        Ok((stream, _response)) => stream,
        Err(e) => {
            tracing::debug!(%url, error = %e, "connection failed");
            events(SocketEvent::Error(e.to_string()));
            events(SocketEvent::Close);
            return;
        },
    };

    events(SocketEvent::Open);
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = write.send(Message::Text(frame)).await {
                        events(SocketEvent::Error(e.to_string()));
                        break;
                    }
                },
                Some(Outbound::Close) | None => {
                    if let Err(e) = write.send(Message::Close(None)).await {
                        tracing::debug!(%url, error = %e, "close frame not sent");
                    }
                    break;
                },
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => events(SocketEvent::Message(text)),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {},
                Some(Err(e)) => {
                    events(SocketEvent::Error(e.to_string()));
                    break;
                },
            },
        }
    }

    events(SocketEvent::Close);
}

/// Resolves once the handle asks to close or goes away. Frames queued before
/// the socket opened are dropped.
async fn closed_while_connecting(commands: &mut UnboundedReceiver<Outbound>) {
    loop {
        match commands.recv().await {
            Some(Outbound::Frame(_)) => {},
            Some(Outbound::Close) | None => return,
        }
    }
}
