//! The cache library facade embedded in application servers: routes each
//! operation to the owning node, serves hot reads from the lease-coherent
//! local cache, and decides per read whether to request a lease.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::client::apistub::NodeConn;
use crate::client::cache::CacheStore;
use crate::client::callback::CallbackServer;
use crate::client::tracker::{QueryTracker, QUERY_THRESHOLD, QUERY_WINDOW_SECS};
use crate::ring::RingView;
use crate::server::{Command, CommandResult, Status};
use crate::utils::LeaseKvError;

use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// How eagerly the library requests leases on reads.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LeaseMode {
    /// Never request leases (cache effectively disabled).
    Never,

    /// Request a lease once a key passes the query threshold.
    Normal,

    /// Request a lease on every read.
    Always,
}

/// Cache library configuration parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Background sweep interval for expired cache/tracker state, in
    /// milliseconds.
    pub sweep_interval_ms: u64,

    /// Query-rate window, in milliseconds.
    pub query_window_ms: u64,

    /// Reads within the window at which `Normal` mode requests a lease.
    pub query_threshold: usize,

    /// Attempts against `NotReady` when fetching the ring at setup.
    pub ring_fetch_retries: u32,

    /// Pause between ring fetch attempts, in milliseconds.
    pub ring_fetch_backoff_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            sweep_interval_ms: 1000,
            query_window_ms: QUERY_WINDOW_SECS * 1000,
            query_threshold: QUERY_THRESHOLD,
            ring_fetch_retries: 5,
            ring_fetch_backoff_ms: 1000,
        }
    }
}

impl ClientConfig {
    /// Parses a config from an optional TOML string over defaults.
    pub fn from_toml(
        conf_str: Option<&str>,
    ) -> Result<Self, LeaseKvError> {
        compose_config!(conf_str => ClientConfig; sweep_interval_ms,
                                                  query_window_ms,
                                                  query_threshold,
                                                  ring_fetch_retries,
                                                  ring_fetch_backoff_ms)
    }
}

/// The cache library instance. One per application server process; shared
/// by reference across its worker tasks.
pub struct Libstore {
    /// My client ID (random; logging prefix).
    me: u64,

    /// Lease request mode.
    mode: LeaseMode,

    /// Query threshold for `Normal` mode.
    threshold: usize,

    /// The published ring view fetched at setup.
    ring: RingView,

    /// Lazily-dialed persistent connections, one per node.
    conns: tokio::sync::Mutex<HashMap<SocketAddr, Arc<NodeConn>>>,

    /// Lease-coherent cache of string and list entries.
    cache: Arc<CacheStore>,

    /// Read-rate tracker driving the lease policy.
    tracker: Arc<QueryTracker>,

    /// Revocation endpoint, present when a callback address was given.
    callback: Option<CallbackServer>,

    /// Join handle of the background sweeper task.
    _sweeper_handle: JoinHandle<()>,
}

impl Libstore {
    /// Creates a cache library instance: opens the revocation endpoint (if
    /// a callback bind address is given), fetches the ring view from the
    /// master with bounded retries, and starts the background sweeper.
    pub async fn new_and_setup(
        master_addr: SocketAddr,
        callback_bind: Option<SocketAddr>,
        mode: LeaseMode,
        config: ClientConfig,
    ) -> Result<Self, LeaseKvError> {
        let me = rand::random();
        let cache = Arc::new(CacheStore::new());
        let tracker = Arc::new(QueryTracker::new(Duration::from_millis(
            config.query_window_ms,
        )));

        let callback = match callback_bind {
            Some(bind_addr) => Some(
                CallbackServer::new_and_setup(me, bind_addr, cache.clone())
                    .await?,
            ),
            None => None,
        };

        // dial the master and fetch the ring, backing off on NotReady
        let master_conn = Arc::new(NodeConn::connect(me, master_addr).await?);
        let mut ring = None;
        for attempt in 0..config.ring_fetch_retries {
            match master_conn.call(Command::GetServers).await? {
                CommandResult::Servers {
                    status: Status::Ok,
                    servers,
                } => {
                    ring = Some(RingView::assemble(servers)?);
                    break;
                }
                CommandResult::Servers {
                    status: Status::NotReady,
                    ..
                } => {
                    pl_debug!(me; "ring not ready (attempt {})", attempt);
                    time::sleep(Duration::from_millis(
                        config.ring_fetch_backoff_ms,
                    ))
                    .await;
                }
                other => {
                    return logged_err!(me; "unexpected GetServers reply: \
                                            {:?}", other);
                }
            }
        }
        let Some(ring) = ring else {
            return logged_err!(me; "ring not ready after {} attempts",
                                   config.ring_fetch_retries);
        };
        pl_info!(me; "fetched ring view of {} node(s)", ring.len());

        let mut conns = HashMap::new();
        conns.insert(master_addr, master_conn);

        let sweeper_handle = tokio::spawn(Self::sweeper_task(
            cache.clone(),
            tracker.clone(),
            Duration::from_millis(config.sweep_interval_ms),
        ));

        Ok(Libstore {
            me,
            mode,
            threshold: config.query_threshold,
            ring,
            conns: tokio::sync::Mutex::new(conns),
            cache,
            tracker,
            callback,
            _sweeper_handle: sweeper_handle,
        })
    }

    /// Reads a string-valued key, served from cache when possible.
    pub async fn get(&self, key: &str) -> Result<String, LeaseKvError> {
        let reads = self.tracker.observe(key);
        if let Some(value) = self.cache.get_str(key) {
            pl_trace!(self.me; "cache hit on '{}'", key);
            return Ok(value);
        }

        let want_lease = self.decide_lease(reads);
        if want_lease {
            self.cache.note_lease_request(key);
        }
        let result = self
            .call_owner(
                key,
                Command::Get {
                    key: key.to_owned(),
                    want_lease,
                    callback: self.callback_addr(),
                },
            )
            .await;

        match result {
            Ok(CommandResult::Value {
                status: Status::Ok,
                value: Some(value),
                lease,
            }) => {
                if want_lease {
                    if lease.granted {
                        self.cache.install_str(
                            key,
                            value.clone(),
                            Duration::from_secs(lease.valid_secs.into()),
                        );
                    } else {
                        self.cache.abandon_lease_request(key);
                    }
                }
                Ok(value)
            }
            other => {
                if want_lease {
                    self.cache.abandon_lease_request(key);
                }
                Err(Self::op_error("Get", key, other?))
            }
        }
    }

    /// Overwrites a string-valued key.
    pub async fn put(
        &self,
        key: &str,
        value: &str,
    ) -> Result<(), LeaseKvError> {
        let result = self
            .call_owner(
                key,
                Command::Put {
                    key: key.to_owned(),
                    value: value.to_owned(),
                },
            )
            .await?;
        match result.status() {
            Status::Ok => Ok(()),
            _ => Err(Self::op_error("Put", key, result)),
        }
    }

    /// Reads a list-valued key, served from cache when possible.
    pub async fn get_list(
        &self,
        key: &str,
    ) -> Result<Vec<String>, LeaseKvError> {
        let reads = self.tracker.observe(key);
        if let Some(items) = self.cache.get_list(key) {
            pl_trace!(self.me; "cache hit on list '{}'", key);
            return Ok(items);
        }

        let want_lease = self.decide_lease(reads);
        if want_lease {
            self.cache.note_lease_request(key);
        }
        let result = self
            .call_owner(
                key,
                Command::GetList {
                    key: key.to_owned(),
                    want_lease,
                    callback: self.callback_addr(),
                },
            )
            .await;

        match result {
            Ok(CommandResult::List {
                status: Status::Ok,
                items,
                lease,
            }) => {
                if want_lease {
                    if lease.granted {
                        self.cache.install_list(
                            key,
                            items.clone(),
                            Duration::from_secs(lease.valid_secs.into()),
                        );
                    } else {
                        self.cache.abandon_lease_request(key);
                    }
                }
                Ok(items)
            }
            other => {
                if want_lease {
                    self.cache.abandon_lease_request(key);
                }
                Err(Self::op_error("GetList", key, other?))
            }
        }
    }

    /// Appends a unique item to a list-valued key.
    pub async fn append_to_list(
        &self,
        key: &str,
        item: &str,
    ) -> Result<(), LeaseKvError> {
        let result = self
            .call_owner(
                key,
                Command::ListAppend {
                    key: key.to_owned(),
                    item: item.to_owned(),
                },
            )
            .await?;
        match result.status() {
            Status::Ok => Ok(()),
            _ => Err(Self::op_error("AppendToList", key, result)),
        }
    }

    /// Removes an exact item from a list-valued key.
    pub async fn remove_from_list(
        &self,
        key: &str,
        item: &str,
    ) -> Result<(), LeaseKvError> {
        let result = self
            .call_owner(
                key,
                Command::ListRemove {
                    key: key.to_owned(),
                    item: item.to_owned(),
                },
            )
            .await?;
        match result.status() {
            Status::Ok => Ok(()),
            _ => Err(Self::op_error("RemoveFromList", key, result)),
        }
    }

    /// The advertised revocation endpoint, if one is open.
    fn callback_addr(&self) -> Option<SocketAddr> {
        self.callback.as_ref().map(|cb| cb.addr())
    }

    /// Whether the upcoming read should request a lease, given the number
    /// of reads of the key now within the window. Without a callback
    /// endpoint no lease is ever requested (nodes could not revoke it).
    fn decide_lease(&self, reads: usize) -> bool {
        self.callback.is_some()
            && match self.mode {
                LeaseMode::Never => false,
                LeaseMode::Always => true,
                LeaseMode::Normal => reads >= self.threshold,
            }
    }

    /// Dispatches a command to the node owning `key`, dialing its
    /// connection on first use.
    async fn call_owner(
        &self,
        key: &str,
        cmd: Command,
    ) -> Result<CommandResult, LeaseKvError> {
        let owner = self.ring.owner_of(key).addr;
        let conn = {
            let mut conns = self.conns.lock().await;
            match conns.get(&owner) {
                Some(conn) => conn.clone(),
                None => {
                    let conn =
                        Arc::new(NodeConn::connect(self.me, owner).await?);
                    conns.insert(owner, conn.clone());
                    conn
                }
            }
        };
        conn.call(cmd).await
    }

    /// Flattens a non-OK reply into the single operation-failed error
    /// surfaced to callers.
    fn op_error(op: &str, key: &str, result: CommandResult) -> LeaseKvError {
        let reason = match result.status() {
            Status::KeyNotFound => "key not found",
            Status::ItemNotFound => "item not in list",
            Status::ItemExists => "item already in list",
            Status::WrongServer => "protocol error: wrong server for key",
            Status::NotReady => "ring not ready",
            Status::Ok => "malformed OK reply",
        };
        LeaseKvError(format!("{} '{}' failed: {}", op, key, reason))
    }

    /// Background sweeper: periodically reclaims expired cache entries and
    /// stale tracker windows.
    async fn sweeper_task(
        cache: Arc<CacheStore>,
        tracker: Arc<QueryTracker>,
        interval: Duration,
    ) {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            cache.sweep_expired();
            tracker.sweep_stale();
        }
    }

    /// Number of resident cached string entries.
    #[cfg(test)]
    fn resident_strs(&self) -> usize {
        self.cache.resident_strs()
    }

    /// Number of resident cached list entries.
    #[cfg(test)]
    fn resident_lists(&self) -> usize {
        self.cache.resident_lists()
    }
}
