//! Native messaging framing.
//!
//! Every message is a 4-byte length in native byte order followed by that many
//! bytes of UTF-8 JSON.

use anyhow::{bail, Context};
use sidechat_core::{HostEvent, MAX_EVENT_BYTES};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest message accepted from the extension.
pub const MAX_INCOMING_BYTES: usize = 64 * 1024 * 1024;

/// Browsers disconnect a host that sends a larger message.
pub const MAX_OUTGOING_BYTES: usize = MAX_EVENT_BYTES;

/// Shown in place of an event too large to deliver.
const OVERSIZED_NOTICE: &str = "Message too large to display";

/// Read one frame. Returns `None` on a clean end of input.
pub async fn read_frame<R>(reader: &mut R) -> anyhow::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("Failed to read message length"),
    }

    let len = u32::from_ne_bytes(header) as usize;
    if len > MAX_INCOMING_BYTES {
        bail!("Incoming message of {len} bytes exceeds the {MAX_INCOMING_BYTES} byte limit");
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .context("Truncated message body")?;
    Ok(Some(payload))
}

/// Write one frame and flush. Frames above the browser limit are refused
/// without writing anything.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_OUTGOING_BYTES {
        bail!(
            "Outgoing message of {} bytes exceeds the {MAX_OUTGOING_BYTES} byte limit",
            payload.len()
        );
    }
    let len = u32::try_from(payload.len()).context("Outgoing message too large to frame")?;

    writer.write_all(&len.to_ne_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize and write one event. An event over the browser limit is
/// replaced by an error notice.
pub async fn write_event<W>(writer: &mut W, event: &HostEvent) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut payload = serde_json::to_vec(event).context("Failed to serialize event")?;
    if payload.len() > MAX_OUTGOING_BYTES {
        tracing::warn!(
            bytes = payload.len(),
            limit = MAX_OUTGOING_BYTES,
            "Dropping oversized event"
        );
        payload = serde_json::to_vec(&HostEvent::error_notice(OVERSIZED_NOTICE))
            .context("Failed to serialize event")?;
    }
    write_frame(writer, &payload).await
}
