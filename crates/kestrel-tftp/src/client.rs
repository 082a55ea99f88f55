//! Client entry points.
//!
//! Local file preconditions are checked before any socket is opened: a
//! download refuses to clobber an existing destination, an upload refuses a
//! missing source. Past that, each operation is one [`Session`].

use std::net::SocketAddr;
use std::path::Path;

use tracing::info;

use crate::error::{Result, TftpError};
use crate::packet::Mode;
use crate::session::{Session, SessionConfig};

/// Download `remote_name` from the server into `destination` (RRQ).
pub async fn get(
    server: SocketAddr,
    remote_name: &str,
    destination: &Path,
    mode: Mode,
    config: SessionConfig,
) -> Result<()> {
    if destination.exists() {
        return Err(TftpError::FileExists(destination.to_path_buf()));
    }

    let session = Session::client_get(server, remote_name, destination, mode, config).await?;
    session.run().await?;
    info!("downloaded {} to {}", remote_name, destination.display());
    Ok(())
}

/// Upload `source` to the server as `remote_name` (WRQ).
pub async fn put(
    server: SocketAddr,
    source: &Path,
    remote_name: &str,
    mode: Mode,
    config: SessionConfig,
) -> Result<()> {
    if !source.exists() {
        return Err(TftpError::FileNotFound(source.to_path_buf()));
    }

    let session = Session::client_put(server, source, remote_name, mode, config).await?;
    session.run().await?;
    info!("uploaded {} as {}", source.display(), remote_name);
    Ok(())
}
