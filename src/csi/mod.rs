//! CSI Controller Server
//!
//! Serves the CSI v1 Identity and Controller services over a unix socket and
//! translates each call into scheduler operations.
//!
//! - [`identity`] - plugin info, capabilities and readiness
//! - [`controller`] - volume lifecycle, capacity and capability validation
//! - [`server`] - socket setup and the tonic server loop

pub mod controller;
pub mod identity;
pub mod server;

/// Protobuf types and service stubs generated from `proto/csi.proto`.
pub mod proto {
    #![allow(clippy::all)]
    tonic::include_proto!("csi.v1");
}

pub use controller::CsiController;
pub use identity::CsiIdentity;
pub use server::{serve, socket_path};

/// Name reported by GetPluginInfo; also the provisioner name in StorageClasses.
pub const PLUGIN_NAME: &str = "io.couchestor.csi";

/// StorageClass parameter carrying the replica count.
pub const REPLICA_COUNT_PARAM: &str = "repl";

/// Key of the share URI in the ControllerPublish context.
pub const PUBLISH_URI_KEY: &str = "uri";
