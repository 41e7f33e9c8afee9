//! A TCP transport: one framed connection per request.

use std::{io, sync::Arc};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::{
    codec::MessageCodec,
    core::{
        error::{Error, Result},
        message::Message,
        routing_table::Addr,
        traits::{Handler, Transport},
    },
};

/// Sends each request over a fresh TCP connection to the peer's address and reads back a single
/// response frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request(&self, addr: &Addr, message: Message) -> Result<Message> {
        let stream = TcpStream::connect(addr.as_str()).await.map_err(|e| {
            trace!(%addr, error = %e, "couldn't connect");
            Error::Unreachable(addr.to_string())
        })?;

        let mut framed = Framed::new(stream, MessageCodec::new());
        framed.send(message).await?;

        match framed.next().await {
            Some(response) => Ok(response?),
            None => Err(Error::Unreachable(addr.to_string())),
        }
    }
}

/// Accepts connections on the listener and answers every request read from them with the
/// handler's response.
///
/// Runs until the task driving it is dropped. Failed accepts are logged and skipped.
pub async fn serve<H>(listener: TcpListener, handler: Arc<H>)
where
    H: Handler + ?Sized,
{
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "couldn't accept a connection");
                continue;
            }
        };

        trace!(%peer_addr, "accepted connection");
        let handler = handler.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, handler).await {
                debug!(%peer_addr, error = %e, "connection closed with an error");
            }
        });
    }
}

async fn handle_connection<H>(stream: TcpStream, handler: Arc<H>) -> io::Result<()>
where
    H: Handler + ?Sized,
{
    let mut framed = Framed::new(stream, MessageCodec::new());

    while let Some(message) = framed.next().await {
        let message = message?;

        if !message.is_response() {
            if let Some(response) = handler.handle(message).await {
                framed.send(response).await?;
            }
        } else {
            debug!(message = message.variant_as_str(), "ignoring unsolicited response");
        }
    }

    Ok(())
}
