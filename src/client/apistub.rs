//! Per-node API connection stub: one persistent TCP connection, with a
//! writer task draining a request channel and a reader task demultiplexing
//! replies by request ID. Concurrent calls share the connection without
//! ordering constraints, so a slow operation (e.g. a write waiting out
//! revocations) never delays unrelated calls on the same node.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::server::{ApiReply, ApiRequest, Command, CommandResult, RequestId};
use crate::utils::{
    framed_recv, framed_send, tcp_connect_with_retry, LeaseKvError,
};

use bytes::BytesMut;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Reply slots for calls awaiting their reply, keyed by request ID.
type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<CommandResult>>>>;

/// A multiplexed connection to one storage node.
pub(crate) struct NodeConn {
    /// My client ID (logging prefix).
    me: u64,

    /// The node's address this stub is dialed to.
    addr: SocketAddr,

    /// Sender side of the request channel into the writer task.
    tx_req: mpsc::UnboundedSender<ApiRequest>,

    /// Reply slots shared with the reader task.
    pending: PendingMap,

    /// Next request ID.
    next_id: AtomicU64,

    /// Join handle of the writer task.
    _writer_handle: JoinHandle<()>,

    /// Join handle of the reader task.
    _reader_handle: JoinHandle<()>,
}

impl NodeConn {
    /// Dials `addr` and spawns the connection's writer and reader tasks.
    pub(crate) async fn connect(
        me: u64,
        addr: SocketAddr,
    ) -> Result<Self, LeaseKvError> {
        pl_debug!(me; "connecting to node {}...", addr);
        let stream = tcp_connect_with_retry(addr, 2).await?;
        let (conn_read, conn_write) = stream.into_split();

        let (tx_req, rx_req) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let writer_handle =
            tokio::spawn(Self::writer_task(me, addr, conn_write, rx_req));
        let reader_handle = tokio::spawn(Self::reader_task(
            me,
            addr,
            conn_read,
            pending.clone(),
        ));

        Ok(NodeConn {
            me,
            addr,
            tx_req,
            pending,
            next_id: AtomicU64::new(0),
            _writer_handle: writer_handle,
            _reader_handle: reader_handle,
        })
    }

    /// Issues one command and waits for its reply. Transport breakage
    /// surfaces as an error; replies for other in-flight calls are
    /// unaffected by how long this one takes.
    pub(crate) async fn call(
        &self,
        cmd: Command,
    ) -> Result<CommandResult, LeaseKvError> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let (tx_result, rx_result) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx_result);

        if let Err(e) = self.tx_req.send(ApiRequest { id, cmd }) {
            self.pending.lock().unwrap().remove(&id);
            return logged_err!(self.me; "connection to {} is down: {}",
                                        self.addr, e);
        }

        match rx_result.await {
            Ok(result) => Ok(result),
            Err(_) => logged_err!(self.me; "connection to {} lost awaiting \
                                           reply {}", self.addr, id),
        }
    }

    /// Writer task: serializes request frames onto the socket.
    async fn writer_task(
        me: u64,
        addr: SocketAddr,
        mut conn_write: OwnedWriteHalf,
        mut rx_req: mpsc::UnboundedReceiver<ApiRequest>,
    ) {
        pl_debug!(me; "writer task for {} spawned", addr);

        while let Some(req) = rx_req.recv().await {
            if let Err(e) = framed_send(&mut conn_write, &req).await {
                pl_error!(me; "error sending request to {}: {}", addr, e);
                break;
            }
        }

        pl_debug!(me; "writer task for {} exited", addr);
    }

    /// Reader task: dispatches reply frames into their slots. On transport
    /// breakage all pending slots are dropped, failing their callers.
    async fn reader_task(
        me: u64,
        addr: SocketAddr,
        mut conn_read: OwnedReadHalf,
        pending: PendingMap,
    ) {
        pl_debug!(me; "reader task for {} spawned", addr);
        let mut read_buf = BytesMut::with_capacity(8 + 1024);

        loop {
            match framed_recv::<ApiReply, OwnedReadHalf>(
                &mut read_buf,
                &mut conn_read,
            )
            .await
            {
                Ok(reply) => {
                    let slot = pending.lock().unwrap().remove(&reply.id);
                    match slot {
                        Some(tx_result) => {
                            // a dropped receiver just means the caller
                            // timed out or went away
                            let _ = tx_result.send(reply.result);
                        }
                        None => {
                            pl_warn!(me; "unmatched reply {} from {}",
                                         reply.id, addr);
                        }
                    }
                }
                Err(e) => {
                    pl_debug!(me; "connection to {} closed: {}", addr, e);
                    break;
                }
            }
        }

        pending.lock().unwrap().clear();
        pl_debug!(me; "reader task for {} exited", addr);
    }
}
