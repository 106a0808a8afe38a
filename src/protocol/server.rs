//! Shared TCP accept loop for dispatcher-backed servers
//!
//! Connections are admitted into a bounded pool; each one reads envelopes in
//! a loop, dispatches them, and writes back whatever response the dispatcher
//! produces. Malformed lines get a coded error instead of a dropped socket.

use crate::protocol::{
    read_envelope, write_envelope, Dispatcher, MessageContext, ReadOutcome,
};
use crate::shutdown::ShutdownToken;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Accept connections until shutdown. Beyond `max_connections` concurrent
/// handlers, new sockets are dropped with a warning.
pub async fn serve(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    max_connections: usize,
    shutdown: ShutdownToken,
) {
    let permits = Arc::new(Semaphore::new(max_connections.max(1)));
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote)) => {
                        let Ok(permit) = permits.clone().try_acquire_owned() else {
                            tracing::warn!(%remote, "connection limit reached, dropping connection");
                            continue;
                        };
                        let dispatcher = dispatcher.clone();
                        let token = shutdown.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            handle_connection(stream, remote, dispatcher, token).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    tracing::debug!("accept loop stopped");
}

async fn handle_connection(
    stream: TcpStream,
    remote: std::net::SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown: ShutdownToken,
) {
    let mut stream = BufReader::new(stream);
    let ctx = MessageContext::new(Uuid::new_v4().to_string(), Some(remote), "tcp");

    loop {
        tokio::select! {
            outcome = read_envelope(&mut stream) => {
                match outcome {
                    Ok(ReadOutcome::Closed) => break,
                    Ok(ReadOutcome::Envelope(envelope)) => {
                        let response = dispatcher.dispatch(envelope, &ctx).await;
                        if let Some(response) = response {
                            if let Err(e) = write_envelope(&mut stream, &response).await {
                                tracing::debug!(%remote, error = %e, "write failed");
                                break;
                            }
                        }
                    }
                    Ok(ReadOutcome::Malformed(malformed)) => {
                        tracing::debug!(%remote, code = %malformed.code, "malformed message");
                        let response = dispatcher.respond_malformed(&malformed);
                        if write_envelope(&mut stream, &response).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(%remote, error = %e, "read failed");
                        break;
                    }
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}
