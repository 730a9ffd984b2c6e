//! Inlet accepts and manages file uploads over HTTP.
//!
//! Clients push file data using PUT (single stream), POST with
//! `multipart/form-data` (one or more attached files), and, when enabled,
//! MOVE, COPY, and DELETE over the same URL namespace. Where the operating
//! system and filesystem support it, files do not emerge under their final
//! names before their upload is complete. Software watching the target
//! directory, to mirror new files for example, never observes partial
//! contents.
//!
//! For request authentication, this is how you generate the HMAC in shell
//! scripts and encode it using base64:
//!
//! ```sh
//! key="geheim"
//! timestamp="$(date --utc +%s)"
//! token="streng"
//!
//! printf "${timestamp}${token}" \
//! | openssl dgst -sha256 -hmac "${key}" -binary \
//! | openssl enc -base64
//! ```
//!
//! The result goes into the `signature` parameter of the `Authorization:
//! Signature` header, alongside `Timestamp` and `Token` headers.

pub mod config;
pub mod error;
pub mod logging;
pub mod multipart;
pub mod pathname;
pub mod protofile;
pub mod quota;
pub mod signature;
pub mod storage;
pub mod upload;
pub mod webdav;
