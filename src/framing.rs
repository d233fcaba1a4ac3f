//! Message framing over a byte stream.
//!
//! Two framings are supported:
//!
//! - [`Framing::Lines`]: one JSON document per `\n`-terminated line (default)
//! - [`Framing::ContentLength`]: HTTP-style headers, the same as LSP
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <message-body>
//! ```
//!
//! Header parsing is case-insensitive and handles both CRLF and LF line endings.

use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum message size (100MB) to prevent OOM from malicious/buggy servers.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// How messages are delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    #[default]
    Lines,
    ContentLength,
}

impl FromStr for Framing {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lines" | "line" | "ndjson" => Ok(Framing::Lines),
            "content-length" | "lsp" => Ok(Framing::ContentLength),
            other => Err(anyhow!("Unknown framing: {}", other)),
        }
    }
}

/// Read one framed message body.
///
/// Returns `Ok(None)` on a clean end of stream (EOF between messages).
///
/// # Errors
///
/// Returns an error if:
/// - The stream ends in the middle of a message
/// - The message exceeds `MAX_MESSAGE_SIZE`
/// - A Content-Length header is missing or invalid
/// - The body is not valid UTF-8
pub async fn read_message<R>(reader: &mut R, framing: Framing) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    match framing {
        Framing::Lines => read_line_message(reader).await,
        Framing::ContentLength => read_content_length_message(reader).await,
    }
}

async fn read_line_message<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    loop {
        let mut line = Vec::new();
        let bytes_read = (&mut *reader)
            .take(MAX_MESSAGE_SIZE as u64 + 1)
            .read_until(b'\n', &mut line)
            .await
            .context("Failed to read message line")?;

        if bytes_read == 0 {
            return Ok(None);
        }
        if line.last() != Some(&b'\n') {
            if bytes_read > MAX_MESSAGE_SIZE {
                bail!(
                    "Message size exceeds maximum {} bytes",
                    MAX_MESSAGE_SIZE
                );
            }
            bail!("Connection closed in the middle of a message");
        }

        let text = String::from_utf8(line).context("Message line is not valid UTF-8")?;
        let trimmed = text.trim();
        // Blank lines between messages are keepalive noise
        if trimmed.is_empty() {
            continue;
        }
        return Ok(Some(trimmed.to_string()));
    }
}

async fn read_content_length_message<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;

    loop {
        let mut line = String::new();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .context("Failed to read header line")?;

        if bytes_read == 0 {
            if saw_header {
                bail!("Connection closed while reading headers");
            }
            return Ok(None);
        }

        let trimmed = line.trim();

        if trimmed.is_empty() {
            // Tolerate stray blank lines before a header block
            if !saw_header {
                continue;
            }
            break;
        }
        saw_header = true;

        if let Some(colon_pos) = trimmed.find(':') {
            let key = trimmed[..colon_pos].trim();
            let value = trimmed[colon_pos + 1..].trim();

            if key.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(
                    value
                        .parse()
                        .with_context(|| format!("Invalid Content-Length value: {}", value))?,
                );
            }
            // Other headers (e.g. Content-Type) are ignored
        }
    }

    let size = content_length.ok_or_else(|| anyhow!("Missing Content-Length header"))?;

    if size > MAX_MESSAGE_SIZE {
        bail!(
            "Message size {} exceeds maximum {} bytes",
            size,
            MAX_MESSAGE_SIZE
        );
    }

    let mut body = vec![0u8; size];
    reader
        .read_exact(&mut body)
        .await
        .context("Failed to read message body")?;

    String::from_utf8(body)
        .map(Some)
        .context("Message body is not valid UTF-8")
}

/// Write one framed message and flush.
///
/// The frame is assembled into a single buffer before writing so that a
/// writer shared behind a lock emits whole messages.
pub async fn write_message<W>(writer: &mut W, framing: Framing, body: &str) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if body.len() > MAX_MESSAGE_SIZE {
        bail!(
            "Message size {} exceeds maximum {} bytes",
            body.len(),
            MAX_MESSAGE_SIZE
        );
    }

    let frame = match framing {
        Framing::Lines => {
            if body.contains('\n') {
                bail!("Line-framed message body must not contain a newline");
            }
            let mut frame = String::with_capacity(body.len() + 1);
            frame.push_str(body);
            frame.push('\n');
            frame
        }
        Framing::ContentLength => format!("Content-Length: {}\r\n\r\n{}", body.len(), body),
    };

    writer
        .write_all(frame.as_bytes())
        .await
        .context("Failed to write message")?;
    writer.flush().await.context("Failed to flush message")?;

    Ok(())
}
