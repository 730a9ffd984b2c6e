//! MOVE, COPY, and DELETE over the upload namespace.
//!
//! Both operands go through the same path translation as uploads, minus the
//! randomized suffix, and the storage root itself is never a legal operand.

use std::io;

use axum::http::{HeaderMap, StatusCode};
use percent_encoding::percent_decode_str;
use tracing::info;

use crate::config::ScopeConfig;
use crate::error::UploadError;
use crate::pathname::{self, Resolved};
use crate::storage::Storage;

pub(crate) async fn serve_move(
    config: &ScopeConfig,
    storage: &dyn Storage,
    path: &str,
    headers: &HeaderMap,
) -> Result<StatusCode, UploadError> {
    let (source, destination) = endpoints(config, path, headers)?;
    if source.path == destination.path {
        return Err(UploadError::NameConflict);
    }

    storage
        .rename(&source.path, &destination.path)
        .await
        .map_err(map_fs_error)?;
    info!(from = %source.key, to = %destination.key, "renamed");
    Ok(StatusCode::CREATED)
}

pub(crate) async fn serve_copy(
    config: &ScopeConfig,
    storage: &dyn Storage,
    path: &str,
    headers: &HeaderMap,
) -> Result<StatusCode, UploadError> {
    let (source, destination) = endpoints(config, path, headers)?;
    if source.path == destination.path {
        return Err(UploadError::NameConflict);
    }

    let bytes = storage
        .copy(&source.path, &destination.path)
        .await
        .map_err(map_fs_error)?;
    info!(from = %source.key, to = %destination.key, bytes, "copied");
    Ok(StatusCode::CREATED)
}

pub(crate) async fn serve_delete(
    config: &ScopeConfig,
    storage: &dyn Storage,
    path: &str,
) -> Result<StatusCode, UploadError> {
    let target = pathname::resolve(config, path, false)?;
    if target.is_root() {
        return Err(UploadError::Forbidden);
    }

    match storage.remove_all(&target.path).await {
        Ok(()) => {}
        // Gone already is as good as deleted.
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(map_fs_error(err)),
    }
    info!(key = %target.key, "removed");
    Ok(StatusCode::NO_CONTENT)
}

/// Translates the URL path and the `Destination` header; neither may name
/// the storage root.
fn endpoints(
    config: &ScopeConfig,
    path: &str,
    headers: &HeaderMap,
) -> Result<(Resolved, Resolved), UploadError> {
    let destination = headers
        .get("Destination")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or(UploadError::NoDestination)?;
    let destination = destination_path(destination)?;

    let source = pathname::resolve(config, path, false)?;
    let destination = pathname::resolve(config, &destination, false)?;
    if source.is_root() || destination.is_root() {
        return Err(UploadError::Forbidden);
    }
    Ok((source, destination))
}

/// The `Destination` header may carry an absolute URL; only its path matters.
fn destination_path(value: &str) -> Result<String, UploadError> {
    let path = match value.find("://") {
        Some(idx) => {
            let after_authority = &value[idx + 3..];
            match after_authority.find('/') {
                Some(slash) => &after_authority[slash..],
                None => return Err(UploadError::NoDestination),
            }
        }
        None => value,
    };
    percent_decode_str(path)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| UploadError::InvalidPath)
}

fn map_fs_error(err: io::Error) -> UploadError {
    match err.kind() {
        io::ErrorKind::NotFound => UploadError::NotFound,
        io::ErrorKind::PermissionDenied => UploadError::Forbidden,
        _ => {
            #[cfg(unix)]
            if matches!(
                err.raw_os_error(),
                Some(libc::ENOTEMPTY) | Some(libc::EEXIST) | Some(libc::EISDIR) | Some(libc::ENOTDIR)
            ) {
                return UploadError::NameConflict;
            }
            UploadError::Internal(err.to_string())
        }
    }
}
