//! IPC server implementation

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tally_api::{
    ClientInfo, ClientRole, Command, ErrorCode, ErrorInfo, Event, Request, Response,
};
use tally_util::ClientId;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::{IpcError, IpcResult};

/// Message from the IPC layer to the service loop
#[derive(Debug)]
pub enum ServerMessage {
    Request {
        client_id: ClientId,
        request: Request,
    },
    ClientConnected {
        client_id: ClientId,
        info: ClientInfo,
    },
    ClientDisconnected {
        client_id: ClientId,
    },
}

type Clients = Arc<RwLock<HashMap<ClientId, ClientHandle>>>;

/// IPC Server
pub struct IpcServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    clients: Clients,
    event_tx: broadcast::Sender<Event>,
    message_tx: mpsc::UnboundedSender<ServerMessage>,
    message_rx: Mutex<Option<mpsc::UnboundedReceiver<ServerMessage>>>,
}

struct ClientHandle {
    info: ClientInfo,
    response_tx: mpsc::UnboundedSender<String>,
    subscribed: bool,
}

impl IpcServer {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            listener: None,
            clients: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            message_tx,
            message_rx: Mutex::new(Some(message_rx)),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket, replacing a stale one
    pub async fn start(&mut self) -> IpcResult<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        // Owner and group only
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o660))?;

        info!(path = %self.socket_path.display(), "IPC server listening");
        self.listener = Some(listener);
        Ok(())
    }

    /// The receiver can be taken once
    pub async fn take_message_receiver(&self) -> Option<mpsc::UnboundedReceiver<ServerMessage>> {
        self.message_rx.lock().await.take()
    }

    /// Accept connections until the listener fails
    pub async fn run(&self) -> IpcResult<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| IpcError::ServerError("Server not started".into()))?;

        let own_uid = nix::unistd::getuid().as_raw();

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let uid = peer_uid(&stream);
                    let role = role_for_peer(uid, own_uid);

                    let mut info = ClientInfo::new(role);
                    if let Some(uid) = uid {
                        info = info.with_uid(uid);
                    }

                    debug!(
                        client_id = %info.client_id,
                        uid = ?uid,
                        role = ?role,
                        "Accepted connection"
                    );
                    self.handle_client(stream, info).await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_client(&self, stream: UnixStream, info: ClientInfo) {
        let client_id = info.client_id.clone();
        let (read_half, write_half) = stream.into_split();
        let (response_tx, response_rx) = mpsc::unbounded_channel::<String>();

        self.clients.write().await.insert(
            client_id.clone(),
            ClientHandle {
                info: info.clone(),
                response_tx: response_tx.clone(),
                subscribed: false,
            },
        );

        let _ = self.message_tx.send(ServerMessage::ClientConnected {
            client_id: client_id.clone(),
            info,
        });

        tokio::spawn(read_requests(
            read_half,
            client_id.clone(),
            self.clients.clone(),
            self.message_tx.clone(),
            response_tx,
        ));

        tokio::spawn(write_responses(
            write_half,
            client_id,
            self.clients.clone(),
            response_rx,
            self.event_tx.subscribe(),
        ));
    }

    /// Send a response to a specific client
    pub async fn send_response(&self, client_id: &ClientId, response: Response) -> IpcResult<()> {
        let json = serde_json::to_string(&response)?;

        let clients = self.clients.read().await;
        if let Some(handle) = clients.get(client_id) {
            handle
                .response_tx
                .send(json)
                .map_err(|_| IpcError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Broadcast an event to all subscribed clients
    pub fn broadcast_event(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }

    pub async fn get_client_info(&self, client_id: &ClientId) -> Option<ClientInfo> {
        let clients = self.clients.read().await;
        clients.get(client_id).map(|h| h.info.clone())
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Remove the socket file
    pub fn shutdown(&self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reads requests line by line. Ends the client when the peer goes away.
async fn read_requests(
    read_half: OwnedReadHalf,
    client_id: ClientId,
    clients: Clients,
    message_tx: mpsc::UnboundedSender<ServerMessage>,
    response_tx: mpsc::UnboundedSender<String>,
) {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!(client_id = %client_id, "Client disconnected (EOF)");
                break;
            }
            Ok(_) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match serde_json::from_str::<Request>(line) {
                    Ok(request) => {
                        let subscribed = match request.command {
                            Command::SubscribeEvents => Some(true),
                            Command::UnsubscribeEvents => Some(false),
                            _ => None,
                        };
                        if let Some(subscribed) = subscribed
                            && let Some(handle) = clients.write().await.get_mut(&client_id)
                        {
                            handle.subscribed = subscribed;
                        }

                        let _ = message_tx.send(ServerMessage::Request {
                            client_id: client_id.clone(),
                            request,
                        });
                    }
                    Err(e) => {
                        warn!(client_id = %client_id, error = %e, "Invalid request");
                        let response = Response::error(
                            0,
                            ErrorInfo::new(ErrorCode::InvalidRequest, e.to_string()),
                        );
                        if let Ok(json) = serde_json::to_string(&response) {
                            let _ = response_tx.send(json);
                        }
                    }
                }
            }
            Err(e) => {
                debug!(client_id = %client_id, error = %e, "Read error");
                break;
            }
        }
    }

    // Dropping the last sender ends the writer
    clients.write().await.remove(&client_id);
    let _ = message_tx.send(ServerMessage::ClientDisconnected { client_id });
}

/// Writes responses and, for subscribed clients, events
async fn write_responses(
    mut writer: OwnedWriteHalf,
    client_id: ClientId,
    clients: Clients,
    mut response_rx: mpsc::UnboundedReceiver<String>,
    mut event_rx: broadcast::Receiver<Event>,
) {
    loop {
        let line = tokio::select! {
            response = response_rx.recv() => match response {
                Some(response) => response,
                None => break,
            },

            event = event_rx.recv() => match event {
                Ok(event) => {
                    let subscribed = clients
                        .read()
                        .await
                        .get(&client_id)
                        .is_some_and(|h| h.subscribed);
                    if !subscribed {
                        continue;
                    }
                    match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(error = %e, "Failed to serialize event");
                            continue;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(client_id = %client_id, missed, "Client fell behind on events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let mut msg = line;
        msg.push('\n');
        if let Err(e) = writer.write_all(msg.as_bytes()).await {
            debug!(client_id = %client_id, error = %e, "Write error");
            break;
        }
    }
}

/// Root and the service's own user may change state; everyone else observes
pub fn role_for_peer(peer_uid: Option<u32>, own_uid: u32) -> ClientRole {
    match peer_uid {
        Some(0) => ClientRole::Operator,
        Some(uid) if uid == own_uid => ClientRole::Operator,
        _ => ClientRole::Observer,
    }
}

fn peer_uid(stream: &UnixStream) -> Option<u32> {
    use std::os::unix::io::AsFd;

    nix::sys::socket::getsockopt(&stream.as_fd(), nix::sys::socket::sockopt::PeerCredentials)
        .ok()
        .map(|cred| cred.uid())
}
