use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::dap::codec::{self, parse_header_line};
use crate::dap::messages::ProtocolMessage;
use crate::dap::MAX_DAP_HEADER_LINE_BYTES;

#[derive(Debug, Error)]
pub enum DapError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("dap protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, DapError>;

pub struct DapReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> DapReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
        }
    }

    /// Read the next framed message. `Ok(None)` on a clean EOF between
    /// messages; EOF inside a frame is an error.
    pub async fn read_message(&mut self) -> Result<Option<ProtocolMessage>> {
        let Some(bytes) = self.read_raw().await? else {
            return Ok(None);
        };
        codec::decode_body(&bytes).map(Some)
    }

    async fn read_raw(&mut self) -> Result<Option<Vec<u8>>> {
        let mut content_length: Option<usize> = None;
        let mut saw_header_line = false;

        loop {
            let Some(line) = self.read_line_limited().await? else {
                if !saw_header_line {
                    return Ok(None);
                }
                return Err(DapError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF while reading DAP headers",
                )));
            };
            saw_header_line = true;

            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if let Some(len) = parse_header_line(line)? {
                content_length = Some(len);
            }
        }

        let Some(len) = content_length else {
            return Err(DapError::Protocol(
                "DAP message missing Content-Length header".to_string(),
            ));
        };

        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).await?;
        Ok(Some(buf))
    }

    async fn read_line_limited(&mut self) -> Result<Option<String>> {
        let mut buf = Vec::<u8>::new();
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if buf.is_empty() {
                    return Ok(None);
                }
                break;
            }

            let newline_pos = available.iter().position(|&b| b == b'\n');
            let take = newline_pos.map(|pos| pos + 1).unwrap_or(available.len());
            if buf.len() + take > MAX_DAP_HEADER_LINE_BYTES {
                return Err(DapError::Protocol(format!(
                    "DAP header line exceeds maximum size ({MAX_DAP_HEADER_LINE_BYTES} bytes)"
                )));
            }

            buf.extend_from_slice(&available[..take]);
            self.reader.consume(take);
            if newline_pos.is_some() {
                break;
            }
        }

        String::from_utf8(buf)
            .map(Some)
            .map_err(|_| DapError::Protocol("DAP header line is not UTF-8".to_string()))
    }
}

pub struct DapWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> DapWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_message(&mut self, message: &ProtocolMessage) -> Result<()> {
        let framed = codec::encode(message)?;
        self.write_raw(&framed).await
    }

    /// Write pre-framed bytes as-is.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
