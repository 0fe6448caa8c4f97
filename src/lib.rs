//! `meshnet-datapath`: the per-node data plane of a semantic-IP service
//! overlay. A node-local control-channel client keeps this node's view of
//! the cluster's table entries current; the tunnel engine rewrites traffic
//! between an application's ServiceIP view of the world and the concrete
//! InstanceIP of whichever replica a flow gets pinned to.

pub mod admin;
pub mod codec;
pub mod common;
pub mod config;
pub mod control_channel;
pub mod environment;
pub mod error;
pub mod exposer;
pub mod interest;
pub mod model;
pub mod proxy_cache;
pub mod resolver;
pub mod tunnel;

pub use error::{NetError, Result};
