//! CSI gRPC server over a unix domain socket.

use std::path::PathBuf;
use std::sync::Arc;

use futures::stream;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{info, warn};

use super::proto::controller_server::ControllerServer;
use super::proto::identity_server::IdentityServer;
use super::{CsiController, CsiIdentity};
use crate::controller::ControlPlane;
use crate::error::{Error, Result};

/// Resolve a CSI endpoint such as `unix:///csi/csi.sock` to a socket path.
pub fn socket_path(address: &str) -> Result<PathBuf> {
    let path = address
        .strip_prefix("unix://")
        .or_else(|| address.strip_prefix("unix:"))
        .unwrap_or(address);
    if path.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "invalid CSI endpoint '{}'",
            address
        )));
    }
    if path.contains("://") {
        return Err(Error::InvalidArgument(format!(
            "CSI endpoint '{}' is not a unix socket",
            address
        )));
    }
    Ok(PathBuf::from(path))
}

/// Serve the Identity and Controller services until `shutdown` fires.
pub async fn serve(
    address: &str,
    control_plane: Arc<ControlPlane>,
    shutdown: CancellationToken,
) -> Result<()> {
    let path = socket_path(address)?;
    if path.exists() {
        warn!(path = %path.display(), "Removing stale CSI socket");
        std::fs::remove_file(&path)?;
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let listener = UnixListener::bind(&path)?;
    info!(path = %path.display(), "CSI server listening");

    let incoming = Box::pin(stream::unfold(listener, |listener| async move {
        let accepted = listener.accept().await.map(|(conn, _)| conn);
        Some((accepted, listener))
    }));

    let result = Server::builder()
        .add_service(IdentityServer::new(CsiIdentity::new(control_plane.clone())))
        .add_service(ControllerServer::new(CsiController::new(control_plane)))
        .serve_with_incoming_shutdown(incoming, async move {
            shutdown.cancelled().await;
        })
        .await
        .map_err(|e| Error::Internal(format!("CSI server failed: {}", e)));

    if let Err(e) = std::fs::remove_file(&path) {
        warn!(path = %path.display(), error = %e, "Failed to remove CSI socket");
    }
    info!("CSI server stopped");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_socket_path() {
        assert_eq!(
            socket_path("unix:///csi/csi.sock").unwrap(),
            PathBuf::from("/csi/csi.sock")
        );
        assert_eq!(
            socket_path("unix:/tmp/x.sock").unwrap(),
            PathBuf::from("/tmp/x.sock")
        );
        assert_eq!(
            socket_path("/var/run/csi.sock").unwrap(),
            PathBuf::from("/var/run/csi.sock")
        );
        assert_matches!(socket_path("unix://"), Err(Error::InvalidArgument(_)));
        assert_matches!(
            socket_path("tcp://127.0.0.1:10000"),
            Err(Error::InvalidArgument(_))
        );
    }
}
