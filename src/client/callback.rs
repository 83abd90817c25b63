//! Client-side revocation endpoint: a small TCP listener through which
//! storage nodes call back to invalidate cached entries. Revocations are
//! answered straight from the cache maps on their own tasks, never behind
//! outstanding reads or writes.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::client::cache::CacheStore;
use crate::server::{RevokeReply, RevokeRequest, Status};
use crate::utils::{framed_recv, framed_send, tcp_bind_with_retry, LeaseKvError};

use bytes::BytesMut;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// The revocation callback listener.
pub(crate) struct CallbackServer {
    /// Actual bound address, advertised to nodes on lease requests.
    addr: SocketAddr,

    /// Join handle of the acceptor task.
    _acceptor_handle: JoinHandle<()>,
}

impl CallbackServer {
    /// Binds the callback listener and spawns its acceptor task.
    pub(crate) async fn new_and_setup(
        me: u64,
        bind_addr: SocketAddr,
        cache: Arc<CacheStore>,
    ) -> Result<Self, LeaseKvError> {
        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        let addr = listener.local_addr()?;

        let acceptor_handle = tokio::spawn(async move {
            pl_debug!(me; "callback acceptor task spawned");
            loop {
                match listener.accept().await {
                    Ok((conn, peer_addr)) => {
                        pl_trace!(me; "callback connection from {}",
                                      peer_addr);
                        tokio::spawn(Self::servant_task(
                            me,
                            conn,
                            cache.clone(),
                        ));
                    }
                    Err(e) => {
                        pl_warn!(me; "error accepting callback: {}", e);
                    }
                }
            }
        });

        Ok(CallbackServer {
            addr,
            _acceptor_handle: acceptor_handle,
        })
    }

    /// The address nodes should dial for revocations.
    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Answers revocation requests on one connection until it closes.
    async fn servant_task(me: u64, mut conn: TcpStream, cache: Arc<CacheStore>) {
        let mut read_buf = BytesMut::with_capacity(64);
        loop {
            let req: RevokeRequest =
                match framed_recv(&mut read_buf, &mut conn).await {
                    Ok(req) => req,
                    Err(_) => break, // node hung up
                };

            let status = if cache.revoke(&req.key) {
                Status::Ok
            } else {
                Status::KeyNotFound
            };
            pl_debug!(me; "revoked '{}' -> {:?}", req.key, status);

            if let Err(e) = framed_send(
                &mut conn,
                &RevokeReply {
                    id: req.id,
                    status,
                },
            )
            .await
            {
                pl_warn!(me; "error acking revocation: {}", e);
                break;
            }
        }
    }
}
