//! Frame IO over any byte stream.
//!
//! [`FrameStream`] wraps a stream (in practice a TLS stream, plain
//! duplex pipes in tests) and reads and writes whole
//! [`Frame`](crate::protocol::Frame)s.  The head is read line by
//! line up to the `End:` marker and the body is then read using the
//! `Content-Length` header, so frames can be pipelined on one
//! connection.

use anyhow::{anyhow, bail, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::protocol::Frame;

/// Largest start line plus headers we accept.
const MAX_HEAD_BYTES: usize = 16 * 1024;
/// Largest body we accept.  Metadata bundles are small.
pub const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// A stream that speaks frames.  `peer` is only used in diagnostics.
pub struct FrameStream<S> {
    pub peer: String,
    stream: BufReader<S>,
}

impl<S> FrameStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new<P: Into<String>>(peer: P, stream: S) -> Self {
        Self {
            peer: peer.into(),
            stream: BufReader::new(stream),
        }
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        let data = frame.to_string();
        self.stream.write_all(data.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read the next frame.  Returns `Ok(None)` if the peer closed
    /// the connection cleanly between frames.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        let mut head = String::new();
        loop {
            let mut line = String::new();
            let n = self.stream.read_line(&mut line).await?;
            if n == 0 {
                if head.is_empty() {
                    return Ok(None);
                }
                bail!("{} closed the connection mid-frame", self.peer);
            }
            if head.len() + line.len() > MAX_HEAD_BYTES {
                bail!("frame head from {} exceeds {} bytes", self.peer, MAX_HEAD_BYTES);
            }
            let done = line.trim_end_matches(['\r', '\n']) == "End:";
            head.push_str(&line);
            if done {
                break;
            }
        }
        let mut frame = Frame::parse(&head)?;
        let len = frame.content_length()?;
        if len > MAX_BODY_BYTES {
            bail!("frame body from {} exceeds {} bytes", self.peer, MAX_BODY_BYTES);
        }
        if len > 0 {
            let mut body = vec![0u8; len];
            self.stream.read_exact(&mut body).await?;
            let body = String::from_utf8(body).map_err(|_| anyhow!("frame body is not UTF-8"))?;
            frame.body = Some(body);
        }
        Ok(Some(frame))
    }
}
