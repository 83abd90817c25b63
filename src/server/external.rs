//! Client-facing API module: wire message types and the TCP listener that
//! feeds requests into the node's event loop.

use std::net::SocketAddr;

use crate::ring::NodeDesc;
use crate::utils::{
    framed_recv, framed_send, tcp_bind_with_retry, LeaseKvError,
};

use bytes::BytesMut;

use serde::{Deserialize, Serialize};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Request ID type; unique per connection.
pub type RequestId = u64;

/// Connection ID type, assigned by the acceptor in accept order.
pub type ClientId = u64;

/// Reply status of a storage operation.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize,
)]
pub enum Status {
    /// The operation succeeded.
    Ok,
    /// The requested key has no entry in the requested namespace.
    KeyNotFound,
    /// The item to remove is not in the list.
    ItemNotFound,
    /// The key does not fall in the receiving node's hash range.
    WrongServer,
    /// The item to append is already in the list.
    ItemExists,
    /// The ring has not finished forming yet.
    NotReady,
}

/// Lease information piggybacked on read replies.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize,
)]
pub struct LeaseInfo {
    /// Whether a lease was granted for this read.
    pub granted: bool,

    /// Number of seconds the lease stays valid on the holder's clock.
    pub valid_secs: u32,
}

impl LeaseInfo {
    /// A granted lease valid for `valid_secs` seconds.
    pub fn granted(valid_secs: u32) -> Self {
        LeaseInfo {
            granted: true,
            valid_secs,
        }
    }

    /// The not-granted marker.
    pub fn denied() -> Self {
        LeaseInfo::default()
    }
}

/// Operations servable by a storage node.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Add a node to the forming ring (answered meaningfully by the
    /// master; answered from the frozen view elsewhere).
    Register { node: NodeDesc },

    /// Fetch the published ring view.
    GetServers,

    /// Read a string-valued key, optionally asking for a lease. `callback`
    /// is the caller's revocation endpoint and must be present for a lease
    /// to be grantable.
    Get {
        key: String,
        want_lease: bool,
        callback: Option<SocketAddr>,
    },

    /// Read a list-valued key, optionally asking for a lease.
    GetList {
        key: String,
        want_lease: bool,
        callback: Option<SocketAddr>,
    },

    /// Overwrite a string-valued key.
    Put { key: String, value: String },

    /// Append a unique item to a list-valued key, creating the list if
    /// absent.
    ListAppend { key: String, item: String },

    /// Remove an exact item from a list-valued key.
    ListRemove { key: String, item: String },
}

impl Command {
    /// The key this command touches, if it is a keyed storage operation.
    pub fn key(&self) -> Option<&str> {
        match self {
            Command::Get { key, .. }
            | Command::GetList { key, .. }
            | Command::Put { key, .. }
            | Command::ListAppend { key, .. }
            | Command::ListRemove { key, .. } => Some(key),
            Command::Register { .. } | Command::GetServers => None,
        }
    }
}

/// Results paired with `Command` variants.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum CommandResult {
    /// Reply to `Register` and `GetServers`.
    Servers {
        status: Status,
        servers: Vec<NodeDesc>,
    },

    /// Reply to `Get`.
    Value {
        status: Status,
        value: Option<String>,
        lease: LeaseInfo,
    },

    /// Reply to `GetList`.
    List {
        status: Status,
        items: Vec<String>,
        lease: LeaseInfo,
    },

    /// Reply to the mutation commands.
    Ack { status: Status },
}

impl CommandResult {
    /// The status field common to all variants.
    pub fn status(&self) -> Status {
        match self {
            CommandResult::Servers { status, .. }
            | CommandResult::Value { status, .. }
            | CommandResult::List { status, .. }
            | CommandResult::Ack { status } => *status,
        }
    }
}

/// Request envelope received from a client connection.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    /// Request ID, echoed in the reply for demultiplexing.
    pub id: RequestId,

    /// The operation to perform.
    pub cmd: Command,
}

/// Reply envelope sent back to a client connection.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ApiReply {
    /// Request ID this reply answers.
    pub id: RequestId,

    /// Operation result.
    pub result: CommandResult,
}

/// Revocation callback request, sent node -> cache library.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct RevokeRequest {
    /// Request ID (per callback connection).
    pub id: RequestId,

    /// Key whose lease must be dropped.
    pub key: String,
}

/// Revocation callback reply, cache library -> node.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct RevokeReply {
    /// Request ID this reply answers.
    pub id: RequestId,

    /// `Ok` if a cached entry was dropped, `KeyNotFound` otherwise.
    pub status: Status,
}

/// The client-facing TCP API module. Accepts connections, parses request
/// frames into the req channel, and routes reply envelopes back out to the
/// right connection. Replies may be produced by any number of concurrent
/// handler tasks; ordering across requests is not preserved (clients match
/// on request ID).
pub(crate) struct ExternalApi {
    /// My node ID (logging prefix).
    me: u32,

    /// Receiver side of the req channel.
    rx_req: mpsc::UnboundedReceiver<(ClientId, ApiRequest)>,

    /// Sender side of the reply bus, cloned out to handler tasks.
    tx_reply: mpsc::UnboundedSender<(ClientId, ApiReply)>,

    /// Join handle of the acceptor task.
    _acceptor_handle: JoinHandle<()>,

    /// Join handle of the reply router task.
    _router_handle: JoinHandle<()>,
}

impl ExternalApi {
    /// Binds the API listener and spawns the acceptor and reply router
    /// tasks. Returns the module and the actual bound address.
    pub(crate) async fn new_and_setup(
        me: u32,
        api_addr: SocketAddr,
    ) -> Result<(Self, SocketAddr), LeaseKvError> {
        let listener = tcp_bind_with_retry(api_addr, 10).await?;
        let bound_addr = listener.local_addr()?;

        let (tx_req, rx_req) = mpsc::unbounded_channel();
        let (tx_reply, rx_reply) = mpsc::unbounded_channel();

        let (senders_write, senders_read) =
            flashmap::new::<ClientId, mpsc::UnboundedSender<ApiReply>>();

        let acceptor_handle = tokio::spawn(Self::acceptor_task(
            me,
            listener,
            tx_req,
            senders_write,
        ));
        let router_handle =
            tokio::spawn(Self::router_task(me, rx_reply, senders_read));

        Ok((
            ExternalApi {
                me,
                rx_req,
                tx_reply,
                _acceptor_handle: acceptor_handle,
                _router_handle: router_handle,
            },
            bound_addr,
        ))
    }

    /// Waits for the next request from any connection.
    pub(crate) async fn get_req(
        &mut self,
    ) -> Result<(ClientId, ApiRequest), LeaseKvError> {
        match self.rx_req.recv().await {
            Some((client, req)) => Ok((client, req)),
            None => logged_err!(self.me; "req channel has been closed"),
        }
    }

    /// A clone of the reply bus sender, for handler tasks to push their
    /// replies through.
    pub(crate) fn reply_sender(
        &self,
    ) -> mpsc::UnboundedSender<(ClientId, ApiReply)> {
        self.tx_reply.clone()
    }
}

// ExternalApi acceptor task
impl ExternalApi {
    /// Accepts client connections, assigns connection IDs, and spawns one
    /// servant task per connection.
    async fn acceptor_task(
        me: u32,
        listener: TcpListener,
        tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,
        mut senders: flashmap::WriteHandle<
            ClientId,
            mpsc::UnboundedSender<ApiReply>,
        >,
    ) {
        pl_debug!(me; "acceptor task spawned");
        let mut next_id: ClientId = 0;

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    pl_warn!(me; "error accepting connection: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                pl_warn!(me; "error setting nodelay: {}", e);
            }

            let client = next_id;
            next_id += 1;
            pl_info!(me; "accepted connection {} from {}", client, peer_addr);

            let (tx_conn_reply, rx_conn_reply) = mpsc::unbounded_channel();
            let mut senders_guard = senders.guard();
            senders_guard.insert(client, tx_conn_reply);
            senders_guard.publish();

            tokio::spawn(Self::servant_task(
                me,
                client,
                stream,
                tx_req.clone(),
                rx_conn_reply,
            ));
        }
    }

    /// Forwards reply envelopes from the reply bus to the per-connection
    /// reply channels.
    async fn router_task(
        me: u32,
        mut rx_reply: mpsc::UnboundedReceiver<(ClientId, ApiReply)>,
        senders: flashmap::ReadHandle<
            ClientId,
            mpsc::UnboundedSender<ApiReply>,
        >,
    ) {
        pl_debug!(me; "reply router task spawned");

        while let Some((client, reply)) = rx_reply.recv().await {
            let guard = senders.guard();
            match guard.get(&client) {
                Some(tx_conn_reply) => {
                    if tx_conn_reply.send(reply).is_err() {
                        pl_debug!(me; "connection {} gone, reply dropped",
                                      client);
                    }
                }
                None => {
                    pl_warn!(me; "reply for unknown connection {}", client);
                }
            }
        }

        pl_debug!(me; "reply router task exited");
    }

    /// Per-connection servant: reads request frames and writes reply
    /// frames, until the peer hangs up.
    async fn servant_task(
        me: u32,
        client: ClientId,
        stream: TcpStream,
        tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,
        mut rx_reply: mpsc::UnboundedReceiver<ApiReply>,
    ) {
        pl_debug!(me; "servant task for connection {} spawned", client);

        let (mut conn_read, mut conn_write): (OwnedReadHalf, OwnedWriteHalf) =
            stream.into_split();
        let mut read_buf = BytesMut::with_capacity(8 + 1024);

        loop {
            tokio::select! {
                // prioritize draining replies so a burst of requests cannot
                // starve responses on this connection
                biased;

                reply = rx_reply.recv() => {
                    match reply {
                        Some(reply) => {
                            if let Err(e) =
                                framed_send(&mut conn_write, &reply).await
                            {
                                pl_error!(me; "error replying to {}: {}",
                                              client, e);
                                break;
                            }
                            pl_trace!(me; "replied to {} id {}", client,
                                          reply.id);
                        }
                        None => break, // module torn down
                    }
                },

                req = framed_recv::<ApiRequest, OwnedReadHalf>(
                          &mut read_buf, &mut conn_read) => {
                    match req {
                        Ok(req) => {
                            pl_trace!(me; "request from {} id {}", client,
                                          req.id);
                            if tx_req.send((client, req)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            pl_debug!(me; "connection {} closed: {}",
                                          client, e);
                            break;
                        }
                    }
                },
            }
        }

        pl_debug!(me; "servant task for connection {} exited", client);
    }
}
