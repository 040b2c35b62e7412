//! Server connection
//!
//! State machine for one index-server link:
//! stop -> resolve -> connecting -> handshake -> active -> stop.
//! While active it services searches, source lookups, callbacks and
//! shared-files announces, with keep-alive probes on idle.

use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Result;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use crate::alert::{Alert, AlertQueue};
use crate::error::{Ed2kError, ErrorKind};
use crate::hash::FileHash;
use crate::protocol::codec::{decode_frame, encode_frame_compressible};
use crate::protocol::message::{NetworkPoint, ServerMessage, SharedFileEntry};
use crate::protocol::search::SearchRequest;
use crate::protocol::tag::{Tag, TagList};
use crate::protocol::{ct, HIGHID_LOWEST, OP_EDONKEYPROT};
use crate::server::{SRV_TCPFLG_COMPRESSION, SRV_TCPFLG_LARGEFILES, SRV_TCPFLG_NEWTAGS, SRV_TCPFLG_UNICODE};
use crate::settings::{ServerParameters, SessionSettings};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerConnectionState {
    Stop,
    Resolve,
    Connecting,
    Handshake,
    Active,
}

/// One logical link to an index server.
pub struct ServerConnection {
    pub params: ServerParameters,
    pub state: ServerConnectionState,
    stream: TcpStream,
    recv_buf: BytesMut,
    /// id assigned by the server; HighID means directly reachable
    pub client_id: u32,
    pub tcp_flags: u32,
    last_write: Instant,
}

impl ServerConnection {
    /// Run resolve -> connect -> login. Returns the active connection.
    pub async fn connect(
        params: ServerParameters,
        our_hash: FileHash,
        listen_port: u16,
        settings: &SessionSettings,
        alerts: &AlertQueue,
    ) -> Result<Self> {
        let operation_timeout = std::time::Duration::from_secs(params.operations_timeout);

        // resolve
        info!("resolving server {} ({})", params.name, params.host);
        let target = format!("{}:{}", params.host, params.port);
        let addr = timeout(operation_timeout, tokio::net::lookup_host(target.clone()))
            .await
            .map_err(|_| Ed2kError::server_error_with_server("resolve timed out", params.name.clone()))?
            .map_err(|e| Ed2kError::server_error_full("resolve failed", params.name.clone(), e.to_string()))?
            .next()
            .ok_or_else(|| Ed2kError::server_error_with_server("no addresses for host", params.name.clone()))?;

        // connect
        debug!("connecting to server {} at {}", params.name, addr);
        let stream = timeout(operation_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Ed2kError::server_error_with_server("connect timed out", params.name.clone()))?
            .map_err(|e| Ed2kError::server_error_full("connect failed", params.name.clone(), e.to_string()))?;

        let mut connection = Self {
            params,
            state: ServerConnectionState::Handshake,
            stream,
            recv_buf: BytesMut::with_capacity(16 * 1024),
            client_id: 0,
            tcp_flags: 0,
            last_write: Instant::now(),
        };

        // handshake: login then wait for the id assignment
        connection
            .send(&ServerMessage::LoginRequest {
                hash: our_hash,
                point: NetworkPoint::new(0, listen_port),
                tags: login_tags(settings, listen_port),
            })
            .await?;

        loop {
            let message = connection.read_message(operation_timeout).await?;
            match message {
                ServerMessage::IdChange { client_id, tcp_flags } => {
                    connection.client_id = client_id;
                    connection.tcp_flags = tcp_flags;
                    connection.state = ServerConnectionState::Active;
                    info!(
                        "logged into {} as {} ({})",
                        connection.params.name,
                        client_id,
                        if connection.is_high_id() { "HighID" } else { "LowID" }
                    );
                    alerts.post(Alert::ServerConnected {
                        name: connection.params.name.clone(),
                        client_id,
                    });
                    return Ok(connection);
                }
                ServerMessage::Reject => {
                    return Err(Ed2kError::server_error_with_server(
                        "login rejected",
                        connection.params.name.clone(),
                    )
                    .into());
                }
                other => {
                    // servers send greetings before the id assignment
                    connection.surface(other, alerts);
                }
            }
        }
    }

    /// Routable id assigned?
    pub fn is_high_id(&self) -> bool {
        self.client_id >= HIGHID_LOWEST
    }

    /// Post a compiled search expression.
    pub async fn post_search_request(&mut self, request: SearchRequest) -> Result<()> {
        self.send(&ServerMessage::SearchRequest(request)).await
    }

    /// Ask for more results of the previous search.
    pub async fn post_search_more(&mut self) -> Result<()> {
        self.send(&ServerMessage::QueryMoreResult).await
    }

    /// Ask for sources of one file.
    pub async fn post_sources_request(&mut self, hash: FileHash, size: u64) -> Result<()> {
        self.send(&ServerMessage::GetSources { hash, size }).await
    }

    /// Ask the server to relay a callback to a LowID client.
    pub async fn post_callback_request(&mut self, client_id: u32) -> Result<()> {
        self.send(&ServerMessage::CallbackRequest { client_id }).await
    }

    /// Announce shared files, honoring the per-call item limit.
    pub async fn post_announce(&mut self, mut entries: Vec<SharedFileEntry>) -> Result<()> {
        let limit = self.params.announce_items_per_call_limit.max(1);
        while !entries.is_empty() {
            let batch: Vec<SharedFileEntry> = entries.drain(..entries.len().min(limit)).collect();
            debug!("announcing {} shared files to {}", batch.len(), self.params.name);
            self.send(&ServerMessage::OfferFiles(batch)).await?;
        }
        Ok(())
    }

    /// Keep-alive probe when nothing has been written for a while.
    pub async fn tick(&mut self, now: Instant) -> Result<()> {
        if self.state == ServerConnectionState::Active
            && now.duration_since(self.last_write).as_secs() >= self.params.keep_alive_timeout
        {
            trace!("keep-alive to {}", self.params.name);
            self.send(&ServerMessage::GetServerList).await?;
        }
        Ok(())
    }

    /// Read and surface one server message. Returns the message for
    /// callers that route them further.
    pub async fn poll_message(
        &mut self,
        operation_timeout: std::time::Duration,
        alerts: &AlertQueue,
    ) -> Result<ServerMessage> {
        let message = self.read_message(operation_timeout).await?;
        self.surface(message.clone(), alerts);
        Ok(message)
    }

    /// Translate unsolicited traffic into alerts.
    fn surface(&self, message: ServerMessage, alerts: &AlertQueue) {
        match message {
            ServerMessage::ServerText(text) => {
                alerts.post(Alert::ServerText {
                    name: self.params.name.clone(),
                    text,
                });
            }
            ServerMessage::ServerStatus { users, files } => {
                alerts.post(Alert::ServerStatus {
                    name: self.params.name.clone(),
                    users,
                    files,
                });
            }
            ServerMessage::SearchResult { entries, more } => {
                alerts.post(Alert::SearchResult { entries, more });
            }
            ServerMessage::FoundSources { hash, sources } => {
                alerts.post(Alert::FoundSources { hash, sources });
            }
            ServerMessage::CallbackRequested(point) => {
                alerts.post(Alert::CallbackRequested { point });
            }
            ServerMessage::CallbackFailed => {
                alerts.post(Alert::CallbackFailed);
            }
            ServerMessage::ServerIdent { .. } | ServerMessage::ServerList(_) => {
                trace!("server identity/list from {}", self.params.name);
            }
            other => {
                trace!("unrouted server message: {:?}", other);
            }
        }
    }

    async fn send(&mut self, message: &ServerMessage) -> Result<()> {
        let body = message.serialize();
        let frame = encode_frame_compressible(OP_EDONKEYPROT, message.opcode(), &body);
        self.stream.write_all(&frame).await.map_err(|e| {
            Ed2kError::server_error_full("write failed", self.params.name.clone(), e.to_string())
        })?;
        self.last_write = Instant::now();
        Ok(())
    }

    async fn read_message(&mut self, operation_timeout: std::time::Duration) -> Result<ServerMessage> {
        loop {
            if let Some(frame) = decode_frame(&mut self.recv_buf)? {
                let mut body = frame.body;
                return ServerMessage::deserialize(frame.opcode, &mut body);
            }

            let mut chunk = [0u8; 16 * 1024];
            let read = timeout(operation_timeout, self.stream.read(&mut chunk))
                .await
                .map_err(|_| {
                    Ed2kError::server_error_with_server("read timed out", self.params.name.clone())
                })?
                .map_err(|e| Ed2kError::server_error_full("read failed", self.params.name.clone(), e.to_string()))?;
            if read == 0 {
                self.state = ServerConnectionState::Stop;
                return Err(Ed2kError::server_error_with_server(
                    "server closed the connection",
                    self.params.name.clone(),
                )
                .into());
            }
            self.recv_buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Reconnect delay after `failcount` consecutive losses: the base
    /// timeout scaled by the failure count, capped at ten minutes.
    pub fn reconnect_delay(params: &ServerParameters, failcount: u32) -> std::time::Duration {
        let secs = params.reconnect_timeout * failcount.max(1) as u64;
        std::time::Duration::from_secs(secs.min(600))
    }
}

fn login_tags(settings: &SessionSettings, listen_port: u16) -> TagList {
    let mut tags = TagList::new();
    tags.push(Tag::string(ct::CT_NAME, settings.client_name.clone()));
    tags.push(Tag::uint(ct::CT_VERSION, 0x3C));
    tags.push(Tag::uint(ct::CT_PORT, listen_port as u64));
    tags.push(Tag::uint(
        ct::CT_SERVER_FLAGS,
        (SRV_TCPFLG_COMPRESSION | SRV_TCPFLG_NEWTAGS | SRV_TCPFLG_UNICODE | SRV_TCPFLG_LARGEFILES) as u64,
    ));
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::encode_frame;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    struct FakeServer {
        stream: TcpStream,
        recv_buf: BytesMut,
    }

    impl FakeServer {
        async fn read(&mut self) -> ServerMessage {
            loop {
                if let Some(frame) = decode_frame(&mut self.recv_buf).unwrap() {
                    let mut body = frame.body;
                    return ServerMessage::deserialize(frame.opcode, &mut body).unwrap();
                }
                let mut chunk = [0u8; 4096];
                let n = self.stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "client hung up");
                self.recv_buf.extend_from_slice(&chunk[..n]);
            }
        }

        async fn send(&mut self, message: &ServerMessage) {
            let frame = encode_frame(OP_EDONKEYPROT, message.opcode(), &message.serialize());
            self.stream.write_all(&frame).await.unwrap();
        }
    }

    async fn login_pair(assign_id: u32) -> (ServerConnection, FakeServer, Arc<AlertQueue>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut server = FakeServer {
                stream,
                recv_buf: BytesMut::new(),
            };
            let login = server.read().await;
            match login {
                ServerMessage::LoginRequest { tags, .. } => {
                    assert!(tags.find(ct::CT_NAME).is_some());
                }
                other => panic!("expected login, got {:?}", other),
            }
            server
                .send(&ServerMessage::ServerText("welcome".to_string()))
                .await;
            server
                .send(&ServerMessage::IdChange {
                    client_id: assign_id,
                    tcp_flags: SRV_TCPFLG_COMPRESSION,
                })
                .await;
            server
        });

        let params = ServerParameters {
            name: "test".to_string(),
            host: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        };
        let alerts = Arc::new(AlertQueue::new(100));
        let settings = SessionSettings::default();
        let connection = ServerConnection::connect(params, FileHash::hash_block(b"us"), 4662, &settings, &alerts)
            .await
            .unwrap();
        (connection, server_task.await.unwrap(), alerts)
    }

    #[tokio::test]
    async fn test_login_reaches_active() {
        let (connection, _server, alerts) = login_pair(HIGHID_LOWEST + 5).await;
        assert_eq!(connection.state, ServerConnectionState::Active);
        assert!(connection.is_high_id());

        let drained = alerts.drain();
        // greeting then connected
        assert!(drained.iter().any(|a| matches!(a, Alert::ServerText { .. })));
        assert!(drained.iter().any(|a| matches!(a, Alert::ServerConnected { .. })));
    }

    #[tokio::test]
    async fn test_low_id_detected() {
        let (connection, _server, _alerts) = login_pair(0x00FF_FFFF).await;
        assert!(!connection.is_high_id());
    }

    #[tokio::test]
    async fn test_sources_request_and_answer() {
        let (mut connection, mut server, alerts) = login_pair(HIGHID_LOWEST).await;
        let hash = FileHash::hash_block(b"wanted");

        connection.post_sources_request(hash, 1000).await.unwrap();
        match server.read().await {
            ServerMessage::GetSources { hash: got, size } => {
                assert_eq!(got, hash);
                assert_eq!(size, 1000);
            }
            other => panic!("unexpected message: {:?}", other),
        }

        let sources = vec![NetworkPoint::new(HIGHID_LOWEST + 1, 4662)];
        server
            .send(&ServerMessage::FoundSources { hash, sources: sources.clone() })
            .await;
        let message = connection
            .poll_message(std::time::Duration::from_secs(5), &alerts)
            .await
            .unwrap();
        assert!(matches!(message, ServerMessage::FoundSources { .. }));
        assert!(alerts
            .drain()
            .iter()
            .any(|a| matches!(a, Alert::FoundSources { .. })));
    }

    #[tokio::test]
    async fn test_announce_respects_batch_limit() {
        let (mut connection, mut server, _alerts) = login_pair(HIGHID_LOWEST).await;
        connection.params.announce_items_per_call_limit = 2;

        let entries: Vec<SharedFileEntry> = (0..5u8)
            .map(|i| SharedFileEntry {
                hash: FileHash::hash_block(&[i]),
                point: NetworkPoint::new(0xFBFB_FBFB, 0xFBFB),
                tags: TagList::new(),
            })
            .collect();
        connection.post_announce(entries).await.unwrap();

        let mut counts = Vec::new();
        for _ in 0..3 {
            match server.read().await {
                ServerMessage::OfferFiles(batch) => counts.push(batch.len()),
                other => panic!("unexpected message: {:?}", other),
            }
        }
        assert_eq!(counts, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_keep_alive_probe() {
        let (mut connection, mut server, _alerts) = login_pair(HIGHID_LOWEST).await;
        connection.params.keep_alive_timeout = 0;
        connection.tick(Instant::now()).await.unwrap();
        assert!(matches!(server.read().await, ServerMessage::GetServerList));
    }

    #[tokio::test]
    async fn test_reconnect_delay_scales_and_caps() {
        let params = ServerParameters {
            reconnect_timeout: 5,
            ..Default::default()
        };
        assert_eq!(ServerConnection::reconnect_delay(&params, 1).as_secs(), 5);
        assert_eq!(ServerConnection::reconnect_delay(&params, 3).as_secs(), 15);
        assert_eq!(ServerConnection::reconnect_delay(&params, 1000).as_secs(), 600);
    }
}
