//! Networking: TLS set-up, frame IO and the client facing frontend.

pub mod frontend;
pub mod tls_util;
pub mod transport;
