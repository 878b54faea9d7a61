//! The signing service: serves [`RemoteSigner`](super::RemoteSigner)
//! requests from a [`LocalSigner`].
//!
//! Connections must present a client certificate issued by the
//! configured CA; the TLS layer enforces that before any frame is
//! read.  A connection may carry any number of requests.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::task;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::remote::{CREATE_KEY, SIGN};
use super::{LocalSigner, TrustService};
use crate::error::SignerError;
use crate::network::transport::FrameStream;
use crate::protocol::{Frame, TXN};
use crate::tuf::{Digest, KeyId, Role};

pub struct SigningService {
    signer: Arc<LocalSigner>,
}

fn bad_request(reason: &str) -> Frame {
    Frame::response(400, "BAD-REQUEST").with_header("Reason", reason)
}

impl SigningService {
    pub fn new(signer: Arc<LocalSigner>) -> Self {
        Self { signer }
    }

    /// Answer one request frame.  Never fails: problems become 400
    /// or 403 replies.
    pub async fn handle(&self, request: &Frame) -> Frame {
        let mut reply = match request.verb.as_str() {
            CREATE_KEY => self.create_key(request).await,
            SIGN => self.sign(request).await,
            other => bad_request(&format!("unknown verb {other}")),
        };
        if let Some(txn) = request.header(TXN) {
            reply.set_header(TXN, txn);
        }
        reply
    }

    async fn create_key(&self, request: &Frame) -> Frame {
        let role = match request.header("Role").map(str::parse::<Role>) {
            Some(Ok(role)) => role,
            Some(Err(e)) => return bad_request(&e.to_string()),
            None => return bad_request("missing Role header"),
        };
        match self.signer.generate_key(role).await {
            Ok(record) => {
                info!(key_id = %record.id, %role, "created key");
                Frame::response(200, "KEY")
                    .with_header("Key-ID", record.id.as_str())
                    .with_header("Public-Key", &record.public.keyval.public)
            }
            Err(e) => refusal(&e),
        }
    }

    async fn sign(&self, request: &Frame) -> Frame {
        let Some(key_id) = request.header("Key-ID") else {
            return bad_request("missing Key-ID header");
        };
        let digest: Option<Digest> = request
            .header("Digest")
            .and_then(|d| hex::decode(d).ok())
            .and_then(|raw| raw.try_into().ok());
        let Some(digest) = digest else {
            return bad_request("Digest must be 32 hex encoded bytes");
        };
        match self.signer.sign(&KeyId::from(key_id), &digest).await {
            Ok(signature) => {
                debug!(key_id, "signed digest");
                Frame::response(200, "SIGNED")
                    .with_header("Key-ID", signature.keyid.as_str())
                    .with_header("Signature", &signature.sig)
            }
            Err(e) => refusal(&e),
        }
    }

    /// Accept connections on `listener` until it fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, tls: Arc<ServerConfig>) -> Result<()> {
        let acceptor = TlsAcceptor::from(tls);
        info!(addr = %listener.local_addr()?, "signing service listening");
        loop {
            let (socket, peer_addr) = listener.accept().await?;
            let acceptor = acceptor.clone();
            let service = self.clone();
            task::spawn(async move {
                let stream = match acceptor.accept(socket).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(peer = %peer_addr, error = %e, "TLS handshake failed");
                        return;
                    }
                };
                let mut tunnel = FrameStream::new(peer_addr.to_string(), stream);
                loop {
                    match tunnel.read_frame().await {
                        Ok(Some(request)) => {
                            let reply = service.handle(&request).await;
                            if let Err(e) = tunnel.send_frame(&reply).await {
                                warn!(peer = %peer_addr, error = %e, "failed to send reply");
                                return;
                            }
                        }
                        Ok(None) => return,
                        Err(e) => {
                            warn!(peer = %peer_addr, error = %e, "dropping connection");
                            return;
                        }
                    }
                }
            });
        }
    }
}

fn refusal(e: &SignerError) -> Frame {
    let status = match e {
        SignerError::Rejected(_) => 403,
        _ => 500,
    };
    let reason = if status == 403 { "DENIED" } else { "ERROR" };
    Frame::response(status, reason).with_header("Reason", &e.to_string())
}
