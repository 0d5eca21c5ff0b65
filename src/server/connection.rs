use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn, Instrument, Span};
use crate::message::{CodeClass, Envelope};
use crate::server::{ClientId, ServerInner};
use crate::transport::framing::{read_envelope, write_envelope, FrameAccumulator};
use crate::transport::IpcStream;

/// Where the server puts envelopes for one subscribed client
pub trait EventSink: Send + Sync {
    /// Returns `false` if the client is gone
    fn send_event(&self, envelope: &Envelope) -> bool;
}

/// The sending side of a connection's writer task. Replies and events share the queue, so a
///  client sees them in the order the server produced them.
pub(crate) struct ClientSink {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ClientSink {
    pub fn channel() -> (Arc<ClientSink>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ClientSink { tx }), rx)
    }

    pub fn send(&self, envelope: Envelope) -> bool {
        self.tx.send(envelope).is_ok()
    }
}

impl EventSink for ClientSink {
    fn send_event(&self, envelope: &Envelope) -> bool {
        self.send(envelope.clone())
    }
}

#[tracing::instrument(name = "client_connection", skip(server, sink, rx, stream), fields(peer = %stream.peer))]
pub(crate) async fn run_connection(server: Arc<ServerInner>, client: ClientId, sink: Arc<ClientSink>, mut rx: mpsc::UnboundedReceiver<Envelope>, stream: IpcStream) {
    debug!("client connected");
    let IpcStream { mut reader, mut writer, .. } = stream;

    // ends once every sink for the connection is dropped, after flushing what is queued
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            trace!("sending {:?}", envelope.code);
            if let Err(e) = write_envelope(writer.as_mut(), &envelope).await {
                debug!("writing to client failed: {}", e);
                return;
            }
        }
        if let Err(e) = writer.shutdown().await {
            debug!("error closing connection: {}", e);
        }
    }.instrument(Span::current()));

    let mut acc = FrameAccumulator::new();
    loop {
        match read_envelope(reader.as_mut(), &mut acc).await {
            Ok(Some(envelope)) => {
                match envelope.code.classify() {
                    Ok(CodeClass::Command(_)) => {
                        let reply = server.handle_command(client, &sink, envelope).await;
                        if !sink.send(reply) {
                            break;
                        }
                    }
                    Ok(CodeClass::Event(_)) => {
                        warn!("client sent event code {:?} - closing connection", envelope.code);
                        break;
                    }
                    Err(e) => {
                        warn!("protocol error, closing connection: {}", e);
                        break;
                    }
                }
            }
            Ok(None) => {
                debug!("client closed the connection");
                break;
            }
            Err(e) => {
                debug!("connection broke: {}", e);
                break;
            }
        }
    }

    drop(reader);
    server.remove_connection(client).await;
}
