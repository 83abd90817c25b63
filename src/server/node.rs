//! Storage node: wires the external API, storage engine, lease ledger, and
//! ring membership together, and drives the request event loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};

use crate::ring::{store_hash, NodeDesc, NodeId, RingView};
use crate::server::external::{
    ApiReply, ApiRequest, ClientId, Command, CommandResult, ExternalApi,
    LeaseInfo, Status,
};
use crate::server::leases::{
    LeaseLedger, RevokeDispatch, TcpRevoker, LEASE_GUARD_SECS,
    LEASE_VALID_SECS,
};
use crate::server::registry::{RegisterOutcome, RingRegistry};
use crate::server::store::KvStore;
use crate::utils::{
    framed_recv, framed_send, tcp_connect_with_retry, LeaseKvError,
};

use bytes::BytesMut;

use tokio::sync::mpsc;
use tokio::time::{self, Duration};

/// Storage node configuration parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Lease validity window handed to holders, in milliseconds.
    pub lease_valid_ms: u64,

    /// Guard margin the grantor waits past validity, in milliseconds.
    pub lease_guard_ms: u64,

    /// Initial back-off between ring-join attempts, in milliseconds.
    pub join_backoff_base_ms: u64,

    /// Back-off cap between ring-join attempts, in milliseconds.
    pub join_backoff_cap_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            lease_valid_ms: LEASE_VALID_SECS * 1000,
            lease_guard_ms: LEASE_GUARD_SECS * 1000,
            join_backoff_base_ms: 500,
            join_backoff_cap_ms: 5000,
        }
    }
}

impl ServerConfig {
    /// Parses a config from an optional TOML string over defaults.
    pub fn from_toml(
        conf_str: Option<&str>,
    ) -> Result<Self, LeaseKvError> {
        compose_config!(conf_str => ServerConfig; lease_valid_ms,
                                                  lease_guard_ms,
                                                  join_backoff_base_ms,
                                                  join_backoff_cap_ms)
    }
}

/// A storage node ready to serve its share of the key space.
pub struct StorageNode {
    /// Shared node state handed to request handler tasks.
    inner: Arc<NodeInner>,

    /// Client-facing API module.
    api: ExternalApi,

    /// Actual bound API address.
    addr: SocketAddr,
}

/// State shared by all request handler tasks of a node.
struct NodeInner {
    /// My node descriptor (ring ID + advertised address).
    me: NodeDesc,

    /// The ring view; set exactly once when formation completes.
    ring: OnceLock<RingView>,

    /// Ring formation registry; present on the master only.
    registry: Option<RingRegistry>,

    /// Authoritative key/value state.
    store: KvStore,

    /// Outstanding leases and revocation bookkeeping.
    ledger: LeaseLedger,

    /// Per-key write gates serializing mutations (and their revocation
    /// waits) against each other. Gates for idle keys are dropped.
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,

    /// Revocation callback delivery.
    dispatch: Box<dyn RevokeDispatch>,
}

impl StorageNode {
    /// Creates a node and binds its API listener. `master_addr` of `None`
    /// makes this node the master of a ring expecting `cluster_size`
    /// members; otherwise the node joins through the given master.
    pub async fn new_and_setup(
        id: NodeId,
        bind_addr: SocketAddr,
        master_addr: Option<SocketAddr>,
        cluster_size: usize,
        config: ServerConfig,
    ) -> Result<Self, LeaseKvError> {
        let (api, bound_addr) =
            ExternalApi::new_and_setup(id, bind_addr).await?;
        let me = NodeDesc {
            id,
            addr: SocketAddr::new(bind_addr.ip(), bound_addr.port()),
        };

        let registry = match master_addr {
            None => Some(RingRegistry::new(id, cluster_size)?),
            Some(_) => None,
        };

        // the master registers itself directly before serving
        let ring = OnceLock::new();
        if let Some(registry) = &registry {
            if let RegisterOutcome::Complete(view) = registry.register(me)? {
                let _ = ring.set(view);
            }
        }

        let inner = Arc::new(NodeInner {
            me,
            ring,
            registry,
            store: KvStore::new(),
            ledger: LeaseLedger::new(
                id,
                Duration::from_millis(config.lease_valid_ms),
                Duration::from_millis(config.lease_guard_ms),
            ),
            gates: Mutex::new(HashMap::new()),
            dispatch: Box::new(TcpRevoker),
        });

        if let Some(master) = master_addr {
            // everyone else keeps knocking until the view is published
            tokio::spawn(Self::ring_join_task(
                inner.clone(),
                master,
                Duration::from_millis(config.join_backoff_base_ms),
                Duration::from_millis(config.join_backoff_cap_ms),
            ));
        }

        Ok(StorageNode {
            inner,
            api,
            addr: me.addr,
        })
    }

    /// The node's advertised API address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Main event loop: takes requests off the API module and spawns one
    /// handler task per request, so a mutation held up by revocations
    /// never delays traffic on other keys or connections.
    pub async fn run(&mut self) -> Result<(), LeaseKvError> {
        loop {
            let (client, req) = self.api.get_req().await?;
            let inner = self.inner.clone();
            let tx_reply = self.api.reply_sender();
            tokio::spawn(async move {
                Self::handle_req(inner, client, req, tx_reply).await;
            });
        }
    }

    /// Computes the reply for one request and pushes it onto the reply bus.
    async fn handle_req(
        inner: Arc<NodeInner>,
        client: ClientId,
        req: ApiRequest,
        tx_reply: mpsc::UnboundedSender<(ClientId, ApiReply)>,
    ) {
        let me = inner.me.id;
        let result = inner.apply_cmd(req.cmd).await;
        if tx_reply.send((client, ApiReply { id: req.id, result })).is_err()
        {
            pl_debug!(me; "reply bus closed, dropping reply {}", req.id);
        }
    }

    /// Slave-side ring join loop: registers with the master until the
    /// published view comes back, backing off while the ring is forming.
    async fn ring_join_task(
        inner: Arc<NodeInner>,
        master: SocketAddr,
        backoff_base: Duration,
        backoff_cap: Duration,
    ) {
        let me = inner.me;
        let mut backoff = backoff_base;

        loop {
            match Self::register_once(me, master).await {
                Ok(Some(view)) => {
                    pl_info!(me.id; "joined ring of {} node(s)", view.len());
                    let _ = inner.ring.set(view);
                    return;
                }
                Ok(None) => {
                    pl_debug!(me.id; "ring not ready, retrying in {:?}",
                                     backoff);
                }
                Err(e) => {
                    pl_warn!(me.id; "registration attempt failed: {}", e);
                }
            }
            time::sleep(backoff).await;
            backoff = (backoff * 2).min(backoff_cap);
        }
    }

    /// One registration round-trip with the master. `Ok(None)` means the
    /// ring is still forming.
    async fn register_once(
        me: NodeDesc,
        master: SocketAddr,
    ) -> Result<Option<RingView>, LeaseKvError> {
        let mut conn = tcp_connect_with_retry(master, 0).await?;
        framed_send(
            &mut conn,
            &ApiRequest {
                id: 0,
                cmd: Command::Register { node: me },
            },
        )
        .await?;
        let mut read_buf = BytesMut::with_capacity(8 + 1024);
        let reply: ApiReply = framed_recv(&mut read_buf, &mut conn).await?;

        match reply.result {
            CommandResult::Servers {
                status: Status::Ok,
                servers,
            } => Ok(Some(RingView::assemble(servers)?)),
            CommandResult::Servers {
                status: Status::NotReady,
                ..
            } => Ok(None),
            other => Err(LeaseKvError(format!(
                "unexpected registration reply: {:?}",
                other
            ))),
        }
    }
}

impl NodeInner {
    /// Dispatches one command to its handler.
    async fn apply_cmd(&self, cmd: Command) -> CommandResult {
        match cmd {
            Command::Register { node } => self.handle_register(node),
            Command::GetServers => self.handle_get_servers(),
            Command::Get {
                key,
                want_lease,
                callback,
            } => self.handle_get(&key, want_lease, callback),
            Command::GetList {
                key,
                want_lease,
                callback,
            } => self.handle_get_list(&key, want_lease, callback),
            Command::Put { key, value } => {
                self.handle_mutation(&key, |store| store.put(&key, &value))
                    .await
            }
            Command::ListAppend { key, item } => {
                self.handle_mutation(&key, |store| {
                    store.list_append(&key, &item)
                })
                .await
            }
            Command::ListRemove { key, item } => {
                self.handle_mutation(&key, |store| {
                    store.list_remove(&key, &item)
                })
                .await
            }
        }
    }

    /// Handler of Register.
    fn handle_register(&self, node: NodeDesc) -> CommandResult {
        match &self.registry {
            Some(registry) => match registry.register(node) {
                Ok(RegisterOutcome::Complete(view)) => {
                    let servers = view.nodes().to_vec();
                    let _ = self.ring.set(view);
                    CommandResult::Servers {
                        status: Status::Ok,
                        servers,
                    }
                }
                Ok(RegisterOutcome::NotReady) => CommandResult::Servers {
                    status: Status::NotReady,
                    servers: vec![],
                },
                Err(e) => {
                    pl_error!(self.me.id; "registration error: {}", e);
                    CommandResult::Servers {
                        status: Status::NotReady,
                        servers: vec![],
                    }
                }
            },
            // non-masters answer from their cached view once they have one
            None => self.handle_get_servers(),
        }
    }

    /// Handler of GetServers.
    fn handle_get_servers(&self) -> CommandResult {
        match self.ring.get() {
            Some(view) => CommandResult::Servers {
                status: Status::Ok,
                servers: view.nodes().to_vec(),
            },
            None => CommandResult::Servers {
                status: Status::NotReady,
                servers: vec![],
            },
        }
    }

    /// Ownership gate run before every keyed operation. `Ok(())` means
    /// this node owns the key; `Err(status)` is the reply status to bounce
    /// back without doing any work.
    fn check_owned(&self, key: &str) -> Result<(), Status> {
        let Some(ring) = self.ring.get() else {
            return Err(Status::NotReady);
        };
        if !ring.owned_by(self.me.id, store_hash(key)) {
            pl_debug!(self.me.id; "wrong server for key '{}'", key);
            return Err(Status::WrongServer);
        }
        Ok(())
    }

    /// Handler of Get. Lease grant (if any) is registered before the value
    /// is read, so a write that lands later must revoke this holder.
    fn handle_get(
        &self,
        key: &str,
        want_lease: bool,
        callback: Option<SocketAddr>,
    ) -> CommandResult {
        if let Err(status) = self.check_owned(key) {
            return CommandResult::Value {
                status,
                value: None,
                lease: LeaseInfo::denied(),
            };
        }

        let lease = self.try_lease(key, want_lease, callback);
        match self.store.get(key) {
            Some(value) => CommandResult::Value {
                status: Status::Ok,
                value: Some(value),
                lease,
            },
            None => {
                self.retract_unused_lease(key, lease, callback);
                CommandResult::Value {
                    status: Status::KeyNotFound,
                    value: None,
                    lease: LeaseInfo::denied(),
                }
            }
        }
    }

    /// Handler of GetList. Same grant-before-read discipline as Get.
    fn handle_get_list(
        &self,
        key: &str,
        want_lease: bool,
        callback: Option<SocketAddr>,
    ) -> CommandResult {
        if let Err(status) = self.check_owned(key) {
            return CommandResult::List {
                status,
                items: vec![],
                lease: LeaseInfo::denied(),
            };
        }

        let lease = self.try_lease(key, want_lease, callback);
        match self.store.get_list(key) {
            Some(items) => CommandResult::List {
                status: Status::Ok,
                items,
                lease,
            },
            None => {
                self.retract_unused_lease(key, lease, callback);
                CommandResult::List {
                    status: Status::KeyNotFound,
                    items: vec![],
                    lease: LeaseInfo::denied(),
                }
            }
        }
    }

    /// Grants a lease if one was asked for with a callback endpoint and no
    /// revocation is in progress on the key.
    fn try_lease(
        &self,
        key: &str,
        want_lease: bool,
        callback: Option<SocketAddr>,
    ) -> LeaseInfo {
        match callback {
            Some(holder) if want_lease => {
                if self.ledger.try_grant(key, holder) {
                    LeaseInfo::granted(self.ledger.valid_secs())
                } else {
                    LeaseInfo::denied()
                }
            }
            _ => LeaseInfo::denied(),
        }
    }

    /// Withdraws a grant made for a read that turned out to have nothing
    /// to cache (key absent in the requested namespace).
    fn retract_unused_lease(
        &self,
        key: &str,
        lease: LeaseInfo,
        callback: Option<SocketAddr>,
    ) {
        if lease.granted {
            if let Some(holder) = callback {
                self.ledger.retract_grant(key, holder);
            }
        }
    }

    /// Shared mutation path: acquire the key's write gate, run the
    /// freeze/revoke phases, apply the mutation, clear the ledger. The
    /// apply step runs even if revocations fell back to the expiry bound.
    async fn handle_mutation<F>(&self, key: &str, apply: F) -> CommandResult
    where
        F: FnOnce(&KvStore) -> Status,
    {
        if let Err(status) = self.check_owned(key) {
            return CommandResult::Ack { status };
        }

        let gate = self.key_gate(key);
        let guard = gate.lock().await;

        self.ledger.freeze_and_revoke(key, self.dispatch.as_ref()).await;
        let status = apply(&self.store);
        self.ledger.clear_after_apply(key);

        drop(guard);
        drop(gate);
        self.gc_gate(key);

        CommandResult::Ack { status }
    }

    /// Fetches (or creates) the write gate for `key`.
    fn key_gate(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.gates
            .lock()
            .unwrap()
            .entry(key.to_owned())
            .or_default()
            .clone()
    }

    /// Drops `key`'s gate if no mutation currently holds or awaits it.
    fn gc_gate(&self, key: &str) {
        let mut gates = self.gates.lock().unwrap();
        if let Some(gate) = gates.get(key) {
            if Arc::strong_count(gate) == 1 {
                gates.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod node_tests {
    use super::*;
    use crate::server::external::{RevokeReply, RevokeRequest};
    use crate::utils::tcp_bind_with_retry;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    /// Raw framed test client against a node's API address.
    struct Probe {
        conn: TcpStream,
        read_buf: BytesMut,
        next_id: u64,
    }

    impl Probe {
        async fn connect(addr: SocketAddr) -> Result<Self, LeaseKvError> {
            Ok(Probe {
                conn: tcp_connect_with_retry(addr, 2).await?,
                read_buf: BytesMut::with_capacity(8 + 1024),
                next_id: 0,
            })
        }

        async fn roundtrip(
            &mut self,
            cmd: Command,
        ) -> Result<CommandResult, LeaseKvError> {
            let id = self.next_id;
            self.next_id += 1;
            framed_send(&mut self.conn, &ApiRequest { id, cmd }).await?;
            let reply: ApiReply =
                framed_recv(&mut self.read_buf, &mut self.conn).await?;
            assert_eq!(reply.id, id);
            Ok(reply.result)
        }
    }

    async fn spawn_master(
        id: NodeId,
        cluster_size: usize,
        config: ServerConfig,
    ) -> Result<SocketAddr, LeaseKvError> {
        let mut node = StorageNode::new_and_setup(
            id,
            "127.0.0.1:0".parse()?,
            None,
            cluster_size,
            config,
        )
        .await?;
        let addr = node.addr();
        tokio::spawn(async move { node.run().await });
        Ok(addr)
    }

    /// Minimal revocation endpoint: acks every revoke, forwarding each
    /// revoked key (with its arrival instant) out on a channel.
    async fn spawn_revoke_acker(
    ) -> Result<
        (SocketAddr, mpsc::UnboundedReceiver<(String, Instant)>),
        LeaseKvError,
    > {
        let listener =
            tcp_bind_with_retry("127.0.0.1:0".parse()?, 0).await?;
        let addr = listener.local_addr()?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    break;
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut read_buf = BytesMut::new();
                    while let Ok(req) = framed_recv::<RevokeRequest, _>(
                        &mut read_buf,
                        &mut conn,
                    )
                    .await
                    {
                        let _ = tx.send((req.key.clone(), Instant::now()));
                        if framed_send(
                            &mut conn,
                            &RevokeReply {
                                id: req.id,
                                status: Status::Ok,
                            },
                        )
                        .await
                        .is_err()
                        {
                            break;
                        }
                    }
                });
            }
        });
        Ok((addr, rx))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn single_node_put_get() -> Result<(), LeaseKvError> {
        let addr = spawn_master(1, 1, ServerConfig::default()).await?;
        let mut probe = Probe::connect(addr).await?;

        let got = probe
            .roundtrip(Command::Get {
                key: "alice".into(),
                want_lease: false,
                callback: None,
            })
            .await?;
        assert_eq!(got.status(), Status::KeyNotFound);

        let put = probe
            .roundtrip(Command::Put {
                key: "alice".into(),
                value: "hello".into(),
            })
            .await?;
        assert_eq!(put.status(), Status::Ok);

        match probe
            .roundtrip(Command::Get {
                key: "alice".into(),
                want_lease: false,
                callback: None,
            })
            .await?
        {
            CommandResult::Value {
                status,
                value,
                lease,
            } => {
                assert_eq!(status, Status::Ok);
                assert_eq!(value, Some("hello".into()));
                assert!(!lease.granted);
            }
            other => panic!("unexpected result {:?}", other),
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn list_semantics_end_to_end() -> Result<(), LeaseKvError> {
        let addr = spawn_master(1, 1, ServerConfig::default()).await?;
        let mut probe = Probe::connect(addr).await?;

        let append = |key: &str, item: &str| Command::ListAppend {
            key: key.into(),
            item: item.into(),
        };
        let remove = |key: &str, item: &str| Command::ListRemove {
            key: key.into(),
            item: item.into(),
        };

        assert_eq!(probe.roundtrip(append("L", "x")).await?.status(),
                   Status::Ok);
        assert_eq!(probe.roundtrip(append("L", "x")).await?.status(),
                   Status::ItemExists);
        assert_eq!(probe.roundtrip(remove("L", "x")).await?.status(),
                   Status::Ok);
        assert_eq!(probe.roundtrip(remove("L", "x")).await?.status(),
                   Status::ItemNotFound);
        match probe
            .roundtrip(Command::GetList {
                key: "L".into(),
                want_lease: false,
                callback: None,
            })
            .await?
        {
            CommandResult::List { status, items, .. } => {
                assert_eq!(status, Status::Ok);
                assert!(items.is_empty());
            }
            other => panic!("unexpected result {:?}", other),
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn two_node_ring_formation_and_routing(
    ) -> Result<(), LeaseKvError> {
        let master_addr =
            spawn_master(1000, 2, ServerConfig::default()).await?;

        let config = ServerConfig {
            join_backoff_base_ms: 50,
            ..ServerConfig::default()
        };
        let mut slave = StorageNode::new_and_setup(
            2_000_000_000,
            "127.0.0.1:0".parse()?,
            Some(master_addr),
            2,
            config,
        )
        .await?;
        let slave_addr = slave.addr();
        tokio::spawn(async move { slave.run().await });

        // wait until the ring is published
        let mut probe = Probe::connect(master_addr).await?;
        let servers = loop {
            match probe.roundtrip(Command::GetServers).await? {
                CommandResult::Servers {
                    status: Status::Ok,
                    servers,
                } => break servers,
                _ => time::sleep(Duration::from_millis(50)).await,
            }
        };
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].id, 1000);
        assert_eq!(servers[1].id, 2_000_000_000);

        // find keys owned by each side and check the ownership bounce
        let ring = RingView::assemble(servers)?;
        let owned_by = |id: NodeId| {
            (0..)
                .map(|i| format!("key{}", i))
                .find(|k| ring.owner_of(k).id == id)
                .unwrap()
        };
        let master_key = owned_by(1000);
        let slave_key = owned_by(2_000_000_000);

        assert_eq!(
            probe
                .roundtrip(Command::Put {
                    key: master_key.clone(),
                    value: "m".into(),
                })
                .await?
                .status(),
            Status::Ok
        );
        assert_eq!(
            probe
                .roundtrip(Command::Put {
                    key: slave_key.clone(),
                    value: "s".into(),
                })
                .await?
                .status(),
            Status::WrongServer
        );

        let mut slave_probe = Probe::connect(slave_addr).await?;
        assert_eq!(
            slave_probe
                .roundtrip(Command::Put {
                    key: slave_key,
                    value: "s".into(),
                })
                .await?
                .status(),
            Status::Ok
        );
        assert_eq!(
            slave_probe
                .roundtrip(Command::Put {
                    key: master_key,
                    value: "m".into(),
                })
                .await?
                .status(),
            Status::WrongServer
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_revokes_before_applying() -> Result<(), LeaseKvError> {
        let addr = spawn_master(1, 1, ServerConfig::default()).await?;
        let (cb_addr, mut revoked) = spawn_revoke_acker().await?;
        let mut probe = Probe::connect(addr).await?;

        probe
            .roundtrip(Command::Put {
                key: "k".into(),
                value: "a".into(),
            })
            .await?;

        // read with lease
        match probe
            .roundtrip(Command::Get {
                key: "k".into(),
                want_lease: true,
                callback: Some(cb_addr),
            })
            .await?
        {
            CommandResult::Value { status, lease, .. } => {
                assert_eq!(status, Status::Ok);
                assert!(lease.granted);
                assert_eq!(lease.valid_secs, LEASE_VALID_SECS as u32);
            }
            other => panic!("unexpected result {:?}", other),
        }

        // the write must deliver the revocation before its reply comes back
        let put_done = probe
            .roundtrip(Command::Put {
                key: "k".into(),
                value: "b".into(),
            })
            .await?;
        let reply_instant = Instant::now();
        assert_eq!(put_done.status(), Status::Ok);
        let (revoked_key, revoke_instant) =
            revoked.try_recv().expect("no revocation delivered");
        assert_eq!(revoked_key, "k");
        assert!(revoke_instant <= reply_instant);
        Ok(())
    }

    /// Revocation endpoint that sleeps `delay` before acking each revoke.
    async fn spawn_stalling_acker(
        delay: Duration,
    ) -> Result<SocketAddr, LeaseKvError> {
        let listener =
            tcp_bind_with_retry("127.0.0.1:0".parse()?, 0).await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut read_buf = BytesMut::new();
                    while let Ok(req) = framed_recv::<RevokeRequest, _>(
                        &mut read_buf,
                        &mut conn,
                    )
                    .await
                    {
                        time::sleep(delay).await;
                        if framed_send(
                            &mut conn,
                            &RevokeReply {
                                id: req.id,
                                status: Status::Ok,
                            },
                        )
                        .await
                        .is_err()
                        {
                            break;
                        }
                    }
                });
            }
        });
        Ok(addr)
    }

    /// Primes a lease on `key` through a fresh probe connection.
    async fn prime_lease(
        addr: SocketAddr,
        cb_addr: SocketAddr,
        key: &str,
    ) -> Result<(), LeaseKvError> {
        let mut probe = Probe::connect(addr).await?;
        match probe
            .roundtrip(Command::Get {
                key: key.into(),
                want_lease: true,
                callback: Some(cb_addr),
            })
            .await?
        {
            CommandResult::Value { status, lease, .. } => {
                assert_eq!(status, Status::Ok);
                assert!(lease.granted);
                Ok(())
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn get_during_revocation_sees_old_value_denied(
    ) -> Result<(), LeaseKvError> {
        let addr = spawn_master(1, 1, ServerConfig::default()).await?;
        let cb_addr =
            spawn_stalling_acker(Duration::from_millis(400)).await?;
        let mut probe = Probe::connect(addr).await?;

        probe
            .roundtrip(Command::Put {
                key: "k5".into(),
                value: "old".into(),
            })
            .await?;
        prime_lease(addr, cb_addr, "k5").await?;

        // this write stalls ~400 ms awaiting the revocation ack
        let writer = tokio::spawn(async move {
            let mut probe = Probe::connect(addr).await?;
            probe
                .roundtrip(Command::Put {
                    key: "k5".into(),
                    value: "new".into(),
                })
                .await
        });
        time::sleep(Duration::from_millis(100)).await;

        // mid-revocation reads see the pre-mutation value, lease denied
        let start = Instant::now();
        match probe
            .roundtrip(Command::Get {
                key: "k5".into(),
                want_lease: true,
                callback: Some(cb_addr),
            })
            .await?
        {
            CommandResult::Value {
                status,
                value,
                lease,
            } => {
                assert_eq!(status, Status::Ok);
                assert_eq!(value, Some("old".into()));
                assert!(!lease.granted);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(start.elapsed() < Duration::from_millis(200));

        assert_eq!(writer.await??.status(), Status::Ok);
        match probe
            .roundtrip(Command::Get {
                key: "k5".into(),
                want_lease: false,
                callback: None,
            })
            .await?
        {
            CommandResult::Value { value, .. } => {
                assert_eq!(value, Some("new".into()));
            }
            other => panic!("unexpected result {:?}", other),
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unrelated_keys_unaffected_by_revocation_wait(
    ) -> Result<(), LeaseKvError> {
        let addr = spawn_master(1, 1, ServerConfig::default()).await?;
        let cb_addr =
            spawn_stalling_acker(Duration::from_millis(500)).await?;
        let mut probe = Probe::connect(addr).await?;

        probe
            .roundtrip(Command::Put {
                key: "k3".into(),
                value: "a".into(),
            })
            .await?;
        prime_lease(addr, cb_addr, "k3").await?;

        let blocked_writer = tokio::spawn(async move {
            let mut probe = Probe::connect(addr).await?;
            let start = Instant::now();
            let result = probe
                .roundtrip(Command::Put {
                    key: "k3".into(),
                    value: "b".into(),
                })
                .await?;
            Ok::<(Duration, Status), LeaseKvError>((
                start.elapsed(),
                result.status(),
            ))
        });
        time::sleep(Duration::from_millis(50)).await;

        // while k3's write waits out its revocation, k4 runs at full speed
        let start = Instant::now();
        assert_eq!(
            probe
                .roundtrip(Command::Put {
                    key: "k4".into(),
                    value: "x".into(),
                })
                .await?
                .status(),
            Status::Ok
        );
        match probe
            .roundtrip(Command::Get {
                key: "k4".into(),
                want_lease: false,
                callback: None,
            })
            .await?
        {
            CommandResult::Value { status, value, .. } => {
                assert_eq!(status, Status::Ok);
                assert_eq!(value, Some("x".into()));
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(start.elapsed() < Duration::from_millis(300));

        let (blocked_for, status) = blocked_writer.await??;
        assert_eq!(status, Status::Ok);
        assert!(blocked_for >= Duration::from_millis(400));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_applies_via_expiry_when_unacked(
    ) -> Result<(), LeaseKvError> {
        let config = ServerConfig {
            lease_valid_ms: 150,
            lease_guard_ms: 50,
            ..ServerConfig::default()
        };
        let addr = spawn_master(1, 1, config).await?;
        // acks far later than the lease's server-side expiry
        let cb_addr = spawn_stalling_acker(Duration::from_secs(30)).await?;
        let mut probe = Probe::connect(addr).await?;

        probe
            .roundtrip(Command::Put {
                key: "k6".into(),
                value: "old".into(),
            })
            .await?;
        prime_lease(addr, cb_addr, "k6").await?;

        // the write gives up on the ack at lease expiry and applies
        let start = Instant::now();
        assert_eq!(
            probe
                .roundtrip(Command::Put {
                    key: "k6".into(),
                    value: "new".into(),
                })
                .await?
                .status(),
            Status::Ok
        );
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));

        match probe
            .roundtrip(Command::Get {
                key: "k6".into(),
                want_lease: false,
                callback: None,
            })
            .await?
        {
            CommandResult::Value { value, .. } => {
                assert_eq!(value, Some("new".into()));
            }
            other => panic!("unexpected result {:?}", other),
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn no_lease_granted_on_missing_key() -> Result<(), LeaseKvError> {
        let addr = spawn_master(1, 1, ServerConfig::default()).await?;
        let (cb_addr, mut revoked) = spawn_revoke_acker().await?;
        let mut probe = Probe::connect(addr).await?;

        match probe
            .roundtrip(Command::Get {
                key: "ghost".into(),
                want_lease: true,
                callback: Some(cb_addr),
            })
            .await?
        {
            CommandResult::Value { status, lease, .. } => {
                assert_eq!(status, Status::KeyNotFound);
                assert!(!lease.granted);
            }
            other => panic!("unexpected result {:?}", other),
        }

        // a later write should have nobody to revoke
        probe
            .roundtrip(Command::Put {
                key: "ghost".into(),
                value: "v".into(),
            })
            .await?;
        assert!(revoked.try_recv().is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn requests_not_ready_before_formation() -> Result<(), LeaseKvError>
    {
        // master expecting 2 members; only itself registered so far
        let addr = spawn_master(1, 2, ServerConfig::default()).await?;
        let mut probe = Probe::connect(addr).await?;

        assert_eq!(
            probe.roundtrip(Command::GetServers).await?.status(),
            Status::NotReady
        );
        assert_eq!(
            probe
                .roundtrip(Command::Get {
                    key: "k".into(),
                    want_lease: false,
                    callback: None,
                })
                .await?
                .status(),
            Status::NotReady
        );
        Ok(())
    }
}
