//! Client for a remote signing service.
//!
//! Each request opens a fresh mutually authenticated TLS connection,
//! sends one frame and reads one reply.  The whole exchange,
//! connection set-up included, is bounded by the configured timeout.
//!
//! Requests:
//!
//! ```text
//! CREATE-KEY                      SIGN
//! Txn: T-1                        Txn: T-2
//! Role: timestamp                 Key-ID: <hex>
//! End:                            Digest: <hex sha256>
//!                                 End:
//! ```
//!
//! Replies are `200 KEY` (with `Key-ID` and `Public-Key` headers),
//! `200 SIGNED` (with `Key-ID` and a base64 `Signature` header), `403 DENIED` or
//! `400 BAD-REQUEST`, the latter two carrying a `Reason` header.
//! Every reply echoes the request's `Txn`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::TrustService;
use crate::config::RemoteSignerConfig;
use crate::error::SignerError;
use crate::network::tls_util::make_client_config;
use crate::network::transport::FrameStream;
use crate::protocol::{Frame, TxnCounter, TXN};
use crate::tuf::keys::{KeyType, KeyValue, ED25519};
use crate::tuf::{Digest, KeyId, KeyRecord, PublicKey, Role, Signature};

pub const CREATE_KEY: &str = "CREATE-KEY";
pub const SIGN: &str = "SIGN";

pub struct RemoteSigner {
    host: String,
    port: u16,
    server_name: ServerName<'static>,
    tls: Arc<ClientConfig>,
    timeout: Duration,
    txns: TxnCounter,
}

impl RemoteSigner {
    pub fn new(host: &str, port: u16, tls: Arc<ClientConfig>, timeout: Duration) -> anyhow::Result<Self> {
        let server_name =
            ServerName::try_from(host.to_string()).map_err(|_| anyhow!("invalid signer host name {:?}", host))?;
        Ok(Self {
            host: host.to_string(),
            port,
            server_name,
            tls,
            timeout,
            txns: TxnCounter::new(),
        })
    }

    pub fn from_config(config: &RemoteSignerConfig) -> anyhow::Result<Self> {
        let tls = make_client_config(&config.tls_ca_file, &config.tls_client_cert, &config.tls_client_key)?;
        Self::new(&config.hostname, config.port, tls, config.timeout())
    }

    fn peer(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Send `request` and return the reply, which is checked to echo
    /// the request's transaction id and to carry a 200 status.
    async fn round_trip(&self, mut request: Frame) -> Result<Frame, SignerError> {
        let txn = self.txns.next();
        request.set_header(TXN, &txn);
        let verb = request.verb.clone();

        let reply = bounded(self.timeout, self.exchange(&request)).await.map_err(|e| {
            warn!(peer = %self.peer(), %verb, error = %e, "signing service request failed");
            e
        })?;

        if reply.header(TXN) != Some(txn.as_str()) {
            return Err(SignerError::Protocol(format!(
                "reply to {txn} carries transaction {:?}",
                reply.header(TXN)
            )));
        }
        let reason = || reply.header("Reason").unwrap_or("no reason given").to_string();
        match reply.status() {
            Some(200) => {
                debug!(peer = %self.peer(), %verb, %txn, "signing service replied");
                Ok(reply)
            }
            Some(403) => Err(SignerError::Rejected(reason())),
            Some(status) => Err(SignerError::Protocol(format!("status {status}: {}", reason()))),
            None => Err(SignerError::Protocol(format!("unexpected reply {:?}", reply.verb))),
        }
    }

    async fn exchange(&self, request: &Frame) -> Result<Frame, SignerError> {
        let unreachable = |e: &dyn std::fmt::Display| SignerError::Unreachable(format!("{}: {}", self.peer(), e));
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| unreachable(&e))?;
        let connector = TlsConnector::from(self.tls.clone());
        let stream = connector
            .connect(self.server_name.clone(), stream)
            .await
            .map_err(|e| unreachable(&e))?;
        let mut tunnel = FrameStream::new(self.peer(), stream);
        tunnel.send_frame(request).await.map_err(|e| unreachable(&e))?;
        tunnel
            .read_frame()
            .await
            .map_err(|e| unreachable(&e))?
            .ok_or_else(|| unreachable(&"connection closed before reply"))
    }
}

/// Run `fut`, turning an elapsed deadline into `Unreachable`.
async fn bounded<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, SignerError>>,
) -> Result<T, SignerError> {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or_else(|_| Err(SignerError::Unreachable(format!("no reply within {:?}", limit))))
}

fn required<'a>(reply: &'a Frame, header: &str) -> Result<&'a str, SignerError> {
    reply
        .header(header)
        .ok_or_else(|| SignerError::Protocol(format!("reply lacks {header} header")))
}

#[async_trait]
impl TrustService for RemoteSigner {
    async fn generate_key(&self, role: Role) -> Result<KeyRecord, SignerError> {
        let reply = self
            .round_trip(Frame::new(CREATE_KEY).with_header("Role", role.as_str()))
            .await?;
        let public = PublicKey {
            keytype: KeyType::Ed25519,
            keyval: KeyValue {
                public: required(&reply, "Public-Key")?.to_string(),
            },
        };
        if public.verifying_key().is_none() {
            return Err(SignerError::Protocol("public key is not a valid ed25519 key".into()));
        }
        let record = KeyRecord::new(role, public);
        let claimed = required(&reply, "Key-ID")?;
        if record.id.as_str() != claimed {
            return Err(SignerError::Protocol(format!(
                "key id {claimed} does not match public key ({})",
                record.id
            )));
        }
        Ok(record)
    }

    async fn sign(&self, key_id: &KeyId, digest: &Digest) -> Result<Signature, SignerError> {
        let reply = self
            .round_trip(
                Frame::new(SIGN)
                    .with_header("Key-ID", key_id.as_str())
                    .with_header("Digest", &hex::encode(digest)),
            )
            .await?;
        let signed_by = required(&reply, "Key-ID")?;
        if signed_by != key_id.as_str() {
            return Err(SignerError::Protocol(format!("asked {key_id} to sign, got {signed_by}")));
        }
        let signature = Signature {
            keyid: key_id.clone(),
            method: ED25519.to_string(),
            sig: required(&reply, "Signature")?.to_string(),
        };
        if signature.as_ed25519().is_none() {
            return Err(SignerError::Protocol("signature is not a valid ed25519 signature".into()));
        }
        Ok(signature)
    }
}
