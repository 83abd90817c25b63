//! Storage node functionality modules.

mod external;
mod leases;
mod node;
mod registry;
mod store;

pub use external::{
    ApiReply, ApiRequest, ClientId, Command, CommandResult, LeaseInfo,
    RequestId, RevokeReply, RevokeRequest, Status,
};
pub use leases::{LEASE_GUARD_SECS, LEASE_VALID_SECS};
pub use node::{ServerConfig, StorageNode};
