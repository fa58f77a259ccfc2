//! Flock: consistent shared group membership over RPC.
//!
//! Each process runs a [`GroupProvider`] hosting one membership backend
//! (static, centralized, or SWIM failure detection); other code opens
//! [`GroupHandle`]s that cache the group view and refresh it through a
//! digest-gated view-sync RPC.

pub mod backend;
pub mod codec;
pub mod config;
pub mod gossip;
pub mod handle;
pub mod provider;
pub mod transport;
pub mod types;
pub mod view;

// Re-exports
pub use backend::centralized::CentralizedBackend;
pub use backend::static_backend::StaticBackend;
pub use backend::swim::{SwimBackend, SwimConfig};
pub use backend::{
    create_backend, register_backend, BackendFactory, BackendInitArgs, GroupBackend,
    MemberUpdateFn, MetadataUpdateFn, UpdateCallbacks,
};
pub use codec::{decode, encode, read_group_file, write_group_file, WireMember, WireView};
pub use config::{GroupConfig, ProviderConfig};
pub use gossip::{GossipBuffer, GossipEvent, GossipKind};
pub use handle::GroupHandle;
pub use provider::GroupProvider;
pub use transport::{LocalEndpoint, LocalSwitch, RpcRequest, RpcResponse, RpcServer, Transport};
pub use types::{
    Credentials, FlockError, MemberId, UpdateKind, MODE_INIT_UPDATE, MODE_SUBSCRIBE,
    PROVIDER_IDENTITY,
};
pub use view::{GroupView, Member, MetadataEntry};
