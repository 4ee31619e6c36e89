//! Peer-to-peer messaging for ForgeChain
//!
//! Peers talk over WebSocket with one JSON text frame per [`Message`]. Every
//! connection gets a reader task and a writer task; readers push into one
//! event channel drained by the node loop, so message handling is sequential.
//!
//! Inbound connections must present `x-peer-address` and `x-peer-signature`
//! headers. The address has to be on the allow-list and the signature has to
//! verify against the key listed for it, otherwise the upgrade is refused
//! with 401.

use crate::blockchain::Block;
use crate::crypto::{verify_hex_signature, KeyPair};
use crate::error::{ChainError, Result};
use crate::transaction::Transaction;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

pub const PEER_ADDRESS_HEADER: &str = "x-peer-address";
pub const PEER_SIGNATURE_HEADER: &str = "x-peer-signature";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRequest {
    pub block_number: u64,
    pub request_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolRequest {
    pub pool_request_address: String,
}

/// Wire envelope: `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Addresses the sender is connected to, itself included.
    Handshake(Vec<String>),
    CreateTransaction(Transaction),
    RequestBlock(BlockRequest),
    SendBlock(Block),
    PublishBlock(Block),
    StartMining,
    RequestPool(PoolRequest),
    SendPool(Vec<Transaction>),
}

impl Message {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Message> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "HANDSHAKE",
            Message::CreateTransaction(_) => "CREATE_TRANSACTION",
            Message::RequestBlock(_) => "REQUEST_BLOCK",
            Message::SendBlock(_) => "SEND_BLOCK",
            Message::PublishBlock(_) => "PUBLISH_BLOCK",
            Message::StartMining => "START_MINING",
            Message::RequestPool(_) => "REQUEST_POOL",
            Message::SendPool(_) => "SEND_POOL",
        }
    }
}

pub type ConnectionId = u64;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// What the connection tasks report to the node loop.
#[derive(Debug)]
pub enum NetworkEvent {
    Connected {
        address: String,
        connection: ConnectionId,
        outbound: mpsc::UnboundedSender<Message>,
    },
    Received {
        address: String,
        message: Message,
    },
    Disconnected {
        address: String,
        connection: ConnectionId,
    },
}

/// This node's handshake credentials: its advertised address and a signature over it.
#[derive(Debug, Clone)]
pub struct Identity {
    pub address: String,
    pub signature: String,
}

impl Identity {
    pub fn new(address: String, keypair: &KeyPair) -> Result<Self> {
        let signature = keypair.sign_hex(address.as_bytes())?;
        Ok(Identity { address, signature })
    }
}

/// Allow-list of peer address -> hex public key.
#[derive(Debug, Clone, Default)]
pub struct PeerAuth {
    allowed: HashMap<String, String>,
}

impl PeerAuth {
    pub fn new(allowed: HashMap<String, String>) -> Self {
        PeerAuth { allowed }
    }

    pub fn verify(&self, address: &str, signature: &str) -> Result<()> {
        let public_key = self.allowed.get(address).ok_or_else(|| {
            ChainError::AuthenticationError(format!("{} is not an allowed peer", address))
        })?;
        verify_hex_signature(public_key, address.as_bytes(), signature)
            .map_err(|e| ChainError::AuthenticationError(format!("{}: {}", address, e)))
    }

    fn check_request(&self, request: &Request) -> Result<String> {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| ChainError::AuthenticationError(format!("missing {} header", name)))
        };
        let address = header(PEER_ADDRESS_HEADER)?;
        let signature = header(PEER_SIGNATURE_HEADER)?;
        self.verify(&address, &signature)?;
        Ok(address)
    }
}

fn unauthorized(reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

/// Accepts peers forever. Each authenticated socket becomes its own task pair.
pub async fn listen(
    listener: TcpListener,
    auth: Arc<PeerAuth>,
    events: mpsc::UnboundedSender<NetworkEvent>,
) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), "P2P listener started");
    loop {
        let (stream, remote) = listener.accept().await?;
        let auth = auth.clone();
        let events = events.clone();
        tokio::spawn(async move {
            if let Err(e) = accept_peer(stream, auth, events).await {
                warn!(remote = %remote, error = %e, "inbound peer refused");
            }
        });
    }
}

async fn accept_peer(
    stream: TcpStream,
    auth: Arc<PeerAuth>,
    events: mpsc::UnboundedSender<NetworkEvent>,
) -> Result<()> {
    let mut peer_address = None;
    let ws = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
        match auth.check_request(request) {
            Ok(address) => {
                peer_address = Some(address);
                Ok(response)
            }
            Err(e) => Err(unauthorized(e.to_string())),
        }
    })
    .await?;

    let address = peer_address
        .ok_or_else(|| ChainError::AuthenticationError("handshake carried no address".to_string()))?;
    info!(peer = %address, "inbound peer connected");
    run_connection(ws, address, events).await;
    Ok(())
}

/// Dials `address` with this node's handshake headers and serves the connection.
pub async fn connect(
    address: String,
    identity: Identity,
    events: mpsc::UnboundedSender<NetworkEvent>,
) -> Result<()> {
    let mut request = address.as_str().into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(
        PEER_ADDRESS_HEADER,
        HeaderValue::from_str(&identity.address)
            .map_err(|e| ChainError::NetworkError(format!("bad address header: {}", e)))?,
    );
    headers.insert(
        PEER_SIGNATURE_HEADER,
        HeaderValue::from_str(&identity.signature)
            .map_err(|e| ChainError::NetworkError(format!("bad signature header: {}", e)))?,
    );

    let (ws, _) = tokio_tungstenite::connect_async(request).await?;
    info!(peer = %address, "outbound peer connected");
    run_connection(ws, address, events).await;
    Ok(())
}

/// Spawns [`connect`] and logs a failure instead of returning it.
pub fn dial(address: String, identity: Identity, events: mpsc::UnboundedSender<NetworkEvent>) {
    tokio::spawn(async move {
        if let Err(e) = connect(address.clone(), identity, events).await {
            warn!(peer = %address, error = %e, "failed to connect to peer");
        }
    });
}

async fn run_connection<S>(
    ws: WebSocketStream<S>,
    address: String,
    events: mpsc::UnboundedSender<NetworkEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connection = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
    let (mut sink, mut stream) = ws.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    if events
        .send(NetworkEvent::Connected {
            address: address.clone(),
            connection,
            outbound,
        })
        .is_err()
    {
        return;
    }

    let writer_peer = address.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let text = match message.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!(peer = %writer_peer, error = %e, "failed to encode message");
                    continue;
                }
            };
            if let Err(e) = sink.send(WsMessage::Text(text)).await {
                debug!(peer = %writer_peer, error = %e, "peer write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match Message::decode(&text) {
                Ok(message) => {
                    let event = NetworkEvent::Received {
                        address: address.clone(),
                        message,
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(peer = %address, error = %e, "dropping malformed message"),
            },
            Ok(WsMessage::Close(_)) => {
                debug!(peer = %address, "peer closed connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(peer = %address, error = %e, "peer read failed");
                break;
            }
        }
    }

    writer.abort();
    let _ = events.send(NetworkEvent::Disconnected {
        address,
        connection,
    });
}

/// Live outbound channels by peer address. Owned by the node loop.
#[derive(Debug, Default)]
pub struct Peers {
    connections: HashMap<String, (ConnectionId, mpsc::UnboundedSender<Message>)>,
}

impl Peers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection. A newer connection to the same address replaces the old one.
    pub fn insert(
        &mut self,
        address: String,
        connection: ConnectionId,
        outbound: mpsc::UnboundedSender<Message>,
    ) {
        self.connections.insert(address, (connection, outbound));
    }

    /// Drops the entry only if it still belongs to `connection`.
    pub fn remove(&mut self, address: &str, connection: ConnectionId) -> bool {
        match self.connections.get(address) {
            Some((current, _)) if *current == connection => {
                self.connections.remove(address);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, address: &str) -> bool {
        self.connections.contains_key(address)
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.connections.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn send(&self, address: &str, message: Message) -> bool {
        match self.connections.get(address) {
            Some((_, outbound)) => outbound.send(message).is_ok(),
            None => false,
        }
    }

    pub fn broadcast(&self, message: &Message) {
        for (address, (_, outbound)) in &self.connections {
            if outbound.send(message.clone()).is_err() {
                debug!(peer = %address, kind = message.kind(), "broadcast to closed peer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{TransactionData, MINT_ADDRESS};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_envelope_shape() {
        let message = Message::RequestBlock(BlockRequest {
            block_number: 4,
            request_address: "ws://127.0.0.1:5001".to_string(),
        });
        let value: Value = serde_json::from_str(&message.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "REQUEST_BLOCK",
                "data": {"blockNumber": 4, "requestAddress": "ws://127.0.0.1:5001"}
            })
        );

        let pool = Message::RequestPool(PoolRequest {
            pool_request_address: "ws://a".to_string(),
        });
        let value: Value = serde_json::from_str(&pool.encode().unwrap()).unwrap();
        assert_eq!(value["data"]["poolRequestAddress"], "ws://a");
    }

    #[test]
    fn test_decode_peer_payloads() {
        let handshake = Message::decode(r#"{"type":"HANDSHAKE","data":["ws://a","ws://b"]}"#).unwrap();
        assert_eq!(
            handshake,
            Message::Handshake(vec!["ws://a".to_string(), "ws://b".to_string()])
        );

        let start = Message::decode(r#"{"type":"START_MINING"}"#).unwrap();
        assert_eq!(start, Message::StartMining);

        let tx = Transaction::new(
            MINT_ADDRESS.to_string(),
            "bob".to_string(),
            TransactionData::Purchase { amount: 3 },
            None,
        );
        let text = Message::CreateTransaction(tx.clone()).encode().unwrap();
        assert_eq!(Message::decode(&text).unwrap(), Message::CreateTransaction(tx));
    }

    #[test]
    fn test_malformed_messages_rejected() {
        assert!(Message::decode("not json").is_err());
        assert!(Message::decode(r#"{"type":"SELF_DESTRUCT","data":1}"#).is_err());
        assert!(Message::decode(r#"{"type":"SEND_BLOCK","data":{"number":"x"}}"#).is_err());
    }

    #[test]
    fn test_peer_auth() {
        let keypair = KeyPair::generate();
        let identity = Identity::new("ws://10.0.0.2:5001".to_string(), &keypair).unwrap();
        let auth = PeerAuth::new(HashMap::from([(identity.address.clone(), keypair.address())]));

        assert!(auth.verify(&identity.address, &identity.signature).is_ok());

        let other = KeyPair::generate();
        let forged = Identity::new(identity.address.clone(), &other).unwrap();
        assert!(matches!(
            auth.verify(&forged.address, &forged.signature),
            Err(ChainError::AuthenticationError(_))
        ));

        let stranger = Identity::new("ws://10.0.0.9:5001".to_string(), &keypair).unwrap();
        assert!(auth.verify(&stranger.address, &stranger.signature).is_err());
    }

    #[test]
    fn test_peers_keep_newest_connection() {
        let mut peers = Peers::new();
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();

        peers.insert("ws://a".to_string(), 1, old_tx);
        peers.insert("ws://a".to_string(), 2, new_tx);

        // a late disconnect of the replaced connection must not evict the new one
        assert!(!peers.remove("ws://a", 1));
        assert!(peers.send("ws://a", Message::StartMining));
        assert_eq!(new_rx.try_recv().unwrap(), Message::StartMining);
        assert!(peers.remove("ws://a", 2));
        assert!(peers.is_empty());
    }

    #[tokio::test]
    async fn test_authenticated_round_trip_over_socket() {
        timeout(Duration::from_secs(10), async {
            let server_key = KeyPair::generate();
            let client_key = KeyPair::generate();
            let client_identity =
                Identity::new("ws://client.test:1".to_string(), &client_key).unwrap();

            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let auth = Arc::new(PeerAuth::new(HashMap::from([(
                client_identity.address.clone(),
                client_key.address(),
            )])));

            let (server_events, mut server_rx) = mpsc::unbounded_channel();
            tokio::spawn(listen(listener, auth, server_events));

            let server_address = format!("ws://127.0.0.1:{}", port);

            // wrong key: refused before any event reaches the node
            let (client_events, mut client_rx) = mpsc::unbounded_channel();
            let impostor = Identity::new(client_identity.address.clone(), &server_key).unwrap();
            assert!(connect(server_address.clone(), impostor, client_events.clone())
                .await
                .is_err());

            dial(server_address.clone(), client_identity.clone(), client_events);

            let client_outbound = match client_rx.recv().await.unwrap() {
                NetworkEvent::Connected { address, outbound, .. } => {
                    assert_eq!(address, server_address);
                    outbound
                }
                other => panic!("unexpected event {:?}", other),
            };

            match server_rx.recv().await.unwrap() {
                NetworkEvent::Connected { address, .. } => {
                    assert_eq!(address, client_identity.address)
                }
                other => panic!("unexpected event {:?}", other),
            }

            client_outbound.send(Message::StartMining).unwrap();
            match server_rx.recv().await.unwrap() {
                NetworkEvent::Received { address, message } => {
                    assert_eq!(address, client_identity.address);
                    assert_eq!(message, Message::StartMining);
                }
                other => panic!("unexpected event {:?}", other),
            }
        })
        .await
        .expect("test_authenticated_round_trip_over_socket timed out");
    }
}
