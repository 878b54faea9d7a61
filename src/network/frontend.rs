//! Client facing frontend.
//!
//! Clients speak the frame protocol over TLS:
//!
//! * `PUBLISH <gun>` with a JSON body mapping role names to base64
//!   encoded documents; answered with `200 OK` and one
//!   `Version-<role>` header per committed role.
//! * `FETCH <gun> <role> [version]`; answered with `200 META`, a
//!   `Version` and `SHA256` header and the stored bytes, base64
//!   encoded, as body.
//! * `TIMESTAMP-KEY <gun>`; answered with `200 KEY` carrying
//!   `Key-ID` and `Public-Key`.
//! * `REFRESH-TIMESTAMP <gun>`; answered like `PUBLISH`.
//!
//! Failures are answered with a status line chosen by
//! [`error_status`] and a `Reason` header.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::net::TcpListener;
use tokio::task;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::transport::FrameStream;
use crate::coordinator::{BundleEntry, Committed};
use crate::error::{SignerError, StoreError, UpdateError};
use crate::protocol::{Frame, TXN};
use crate::server::NotaryServer;
use crate::tuf::Role;

fn reply_error(status: u16, reason: &str, detail: &str) -> Frame {
    Frame::response(status, reason).with_header("Reason", detail)
}

/// Status line for a failed request.
pub fn error_status(e: &UpdateError) -> (u16, &'static str) {
    match e {
        UpdateError::Store(StoreError::NotFound { .. }) => (404, "NOT-FOUND"),
        UpdateError::Store(StoreError::VersionConflict { .. }) => (409, "CONFLICT"),
        UpdateError::Store(StoreError::BackendUnavailable(_)) => (503, "UNAVAILABLE"),
        UpdateError::Signer(SignerError::Unreachable(_)) => (503, "UNAVAILABLE"),
        UpdateError::Signer(_) => (502, "SIGNER"),
        _ => (400, "INVALID"),
    }
}

fn failure(e: &UpdateError) -> Frame {
    let (status, reason) = error_status(e);
    reply_error(status, reason, &e.to_string())
}

fn committed(outcome: &Committed) -> Frame {
    let mut reply = Frame::response(200, "OK");
    for (role, version) in &outcome.versions {
        reply.set_header(format!("Version-{role}"), &version.to_string());
    }
    reply
}

/// Answer one request.
pub async fn handle_request(server: &NotaryServer, request: &Frame) -> Frame {
    let mut reply = match (request.verb.as_str(), request.args.as_slice()) {
        ("PUBLISH", [gun]) => publish(server, gun, request.body.as_deref().unwrap_or("")).await,
        ("FETCH", [gun, role]) => fetch(server, gun, role, None).await,
        ("FETCH", [gun, role, version]) => match version.parse::<u64>() {
            Ok(v) => fetch(server, gun, role, Some(v)).await,
            Err(_) => reply_error(400, "INVALID", "version must be a positive integer"),
        },
        ("TIMESTAMP-KEY", [gun]) => match server.timestamp_key(gun).await {
            Ok(key) => Frame::response(200, "KEY")
                .with_header("Key-ID", key.id.as_str())
                .with_header("Public-Key", &key.public.keyval.public),
            Err(e) => failure(&e),
        },
        ("REFRESH-TIMESTAMP", [gun]) => match server.refresh_timestamp(gun).await {
            Ok(outcome) => committed(&outcome),
            Err(e) => failure(&e),
        },
        (verb, args) => reply_error(400, "INVALID", &format!("cannot handle {verb} with {} arguments", args.len())),
    };
    if let Some(txn) = request.header(TXN) {
        reply.set_header(TXN, txn);
    }
    reply
}

async fn publish(server: &NotaryServer, gun: &str, body: &str) -> Frame {
    let encoded: BTreeMap<String, String> = match serde_json::from_str(body) {
        Ok(map) => map,
        Err(e) => return reply_error(400, "INVALID", &format!("body is not a role map: {e}")),
    };
    let mut entries = Vec::with_capacity(encoded.len());
    for (role, data) in encoded {
        match BASE64.decode(data.as_bytes()) {
            Ok(bytes) => entries.push(BundleEntry::new(role, bytes)),
            Err(e) => return reply_error(400, "INVALID", &format!("{role} is not base64: {e}")),
        }
    }
    match server.publish(gun, entries).await {
        Ok(outcome) => committed(&outcome),
        Err(e) => failure(&e),
    }
}

async fn fetch(server: &NotaryServer, gun: &str, role: &str, version: Option<u64>) -> Frame {
    let role: Role = match role.parse() {
        Ok(role) => role,
        Err(_) => return failure(&UpdateError::UnknownRole(role.to_string())),
    };
    let found = match version {
        Some(v) => server.get_version(gun, role, v).await,
        None => server.get_current(gun, role).await,
    };
    match found {
        Ok(meta) => Frame::response(200, "META")
            .with_header("Version", &meta.version.to_string())
            .with_header("SHA256", &meta.sha256)
            .with_body(BASE64.encode(&meta.data)),
        Err(e) => failure(&e.into()),
    }
}

/// Accept client connections on `listener` until it fails.
pub async fn serve(server: Arc<NotaryServer>, listener: TcpListener, tls: Arc<ServerConfig>) -> Result<()> {
    let acceptor = TlsAcceptor::from(tls);
    info!(addr = %listener.local_addr()?, "frontend listening");
    loop {
        let (socket, peer_addr) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let server = server.clone();
        task::spawn(async move {
            let stream = match acceptor.accept(socket).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(peer = %peer_addr, error = %e, "TLS handshake failed");
                    return;
                }
            };
            let mut tunnel = FrameStream::new(peer_addr.to_string(), stream);
            loop {
                match tunnel.read_frame().await {
                    Ok(Some(request)) => {
                        let reply = handle_request(&server, &request).await;
                        if let Err(e) = tunnel.send_frame(&reply).await {
                            warn!(peer = %peer_addr, error = %e, "failed to send reply");
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        let reply = reply_error(400, "INVALID", &e.to_string());
                        if let Err(send_err) = tunnel.send_frame(&reply).await {
                            debug!(peer = %peer_addr, error = %send_err, "failed to send error reply");
                        }
                        warn!(peer = %peer_addr, error = %e, "dropping connection");
                        return;
                    }
                }
            }
        });
    }
}
