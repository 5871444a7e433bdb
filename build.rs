//! Build script for the CoucheStor control plane
//!
//! Generates the CSI v1 gRPC server and message types from `proto/csi.proto`.
//!
//! # Environment Variables
//!
//! - `PROTOC` - Path to a `protoc` binary. When unset the vendored binary from
//!   `protoc-bin-vendored` is used, so no system protobuf install is needed.

use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/csi.proto");
    println!("cargo:rerun-if-env-changed=PROTOC");

    if env::var_os("PROTOC").is_none() {
        let protoc: PathBuf = protoc_bin_vendored::protoc_bin_path()?;
        env::set_var("PROTOC", protoc);
    }

    // Only the Identity and Controller services are served from here
    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_protos(&["proto/csi.proto"], &["proto"])?;

    Ok(())
}
