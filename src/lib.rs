//! Public interface to the LeaseKV core library, linked by both the
//! storage node executable and the client library executable.

#[macro_use]
mod utils;

mod client;
mod ring;
mod server;

pub use client::{
    ClientConfig, LeaseMode, Libstore, QUERY_THRESHOLD, QUERY_WINDOW_SECS,
};
pub use ring::{store_hash, NodeDesc, NodeId, RingView};
pub use server::{
    ApiReply, ApiRequest, ClientId, Command, CommandResult, LeaseInfo,
    RequestId, RevokeReply, RevokeRequest, ServerConfig, Status,
    StorageNode, LEASE_GUARD_SECS, LEASE_VALID_SECS,
};
pub use utils::LeaseKvError;
