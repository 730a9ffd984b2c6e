//! multipart/form-data uploads: one proto file per attached file.
//!
//! Parts are processed in arrival order and accumulate against the
//! transaction ceiling. Parts without a `filename` attribute are plain form
//! fields and skipped. A failing part does not undo its predecessors.

use axum::body::Bytes;
use axum::extract::multipart::Field;
use axum::extract::{FromRequest, Multipart, Request};
use axum::http::StatusCode;
use axum::response::Response;
use tracing::debug;

use crate::config::ScopeConfig;
use crate::error::UploadError;
use crate::quota::TransactionMeter;
use crate::storage::Storage;
use crate::upload::{self, ChunkSource};

/// Decodes the request body and feeds each file part through the upload
/// pipeline, collecting one `Location` key per persisted file.
pub(crate) async fn serve(
    config: &ScopeConfig,
    storage: &dyn Storage,
    url_path: &str,
    request: Request,
) -> Response {
    let mut keys: Vec<String> = Vec::new();
    let result = drive(config, storage, url_path, request, &mut keys).await;
    upload::respond(config, result, &keys)
}

async fn drive(
    config: &ScopeConfig,
    storage: &dyn Storage,
    url_path: &str,
    request: Request,
    keys: &mut Vec<String>,
) -> Result<StatusCode, UploadError> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|_| UploadError::UnsupportedEnvelope)?;

    let mut meter = TransactionMeter::new(config.max_filesize, config.max_transaction_size);

    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|err| UploadError::Malformed(err.to_string()))?;
        let Some(field) = field else { break };

        let Some(filename) = field.file_name().map(str::to_string) else {
            // A form field, not a file.
            continue;
        };
        let advertised = upload::advertised_length(field.headers())?;
        let target = join_target(url_path, &filename);

        let mut source = FieldSource { field };
        let written =
            upload::write_one_blob(config, storage, &mut meter, &target, advertised, &mut source)
                .await?;
        debug!(key = %written.key, bytes = written.bytes, spent = meter.spent(), "part persisted");
        keys.push(written.key);
    }

    Ok(StatusCode::CREATED)
}

/// The URL path supplies the target directory, the part's filename the leaf,
/// which may itself denote nested subdirectories.
fn join_target(url_path: &str, filename: &str) -> String {
    format!("{}/{}", url_path.trim_end_matches('/'), filename)
}

struct FieldSource<'a> {
    field: Field<'a>,
}

impl ChunkSource for FieldSource<'_> {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, UploadError> {
        self.field
            .chunk()
            .await
            .map_err(|err| UploadError::Malformed(err.to_string()))
    }
}
