//! Sidechat native messaging host
//!
//! The sidebar extension launches this process and talks to it over stdio.
//! stdout carries protocol frames only; logs go to stderr.

mod bridge;
mod native;

use std::sync::Arc;

use sidechat_core::{
    event_channel, outbox_channel, Database, HostRequest, MistralClient, OutboxReceiver, Session,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use bridge::ChannelPageSource;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sidechat=debug".parse()?)
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting Sidechat host v{}", sidechat_core::VERSION);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let db = open_database()?;

    let (outbox, outbox_rx) = outbox_channel();
    let (stream_tx, mut stream_rx) = event_channel();
    let pages = ChannelPageSource::new(outbox.clone());
    let mut session = Session::new(db, Arc::new(MistralClient::new()), stream_tx, outbox);

    let (request_tx, mut request_rx) = mpsc::unbounded_channel();
    let reader = tokio::spawn(read_requests(tokio::io::stdin(), pages.clone(), request_tx));
    let writer = tokio::spawn(write_events(tokio::io::stdout(), outbox_rx));

    loop {
        tokio::select! {
            request = request_rx.recv() => match request {
                Some(request) => {
                    debug!(kind = request.kind(), "Handling request");
                    session.handle(request, &pages).await;
                }
                None => {
                    info!("Extension disconnected");
                    break;
                }
            },
            Some(event) = stream_rx.recv() => session.handle_stream_event(event),
        }
    }

    // The request channel only closes once the reader has returned.
    if let Err(e) = join_task(reader).await {
        warn!(error = %e, "Stopped reading from the extension");
    }

    // Dropping every outbox sender lets the writer flush and exit.
    drop(session);
    drop(pages);
    join_task(writer).await
}

/// Wait for an I/O task, folding a panic or cancellation into its error.
async fn join_task(task: JoinHandle<anyhow::Result<()>>) -> anyhow::Result<()> {
    match task.await {
        Ok(result) => result,
        Err(e) => Err(e.into()),
    }
}

/// Open the on-disk store, falling back to memory so the sidebar still works.
fn open_database() -> anyhow::Result<Database> {
    let opened = Database::open().and_then(|db| {
        db.migrate()?;
        Ok(db)
    });
    match opened {
        Ok(db) => {
            if let Some(path) = db.path() {
                info!(path = %path.display(), "Opened database");
            }
            Ok(db)
        }
        Err(e) => {
            warn!(error = %e, "Failed to open database, history will not be saved");
            let db = Database::open_in_memory()?;
            db.migrate()?;
            Ok(db)
        }
    }
}

/// Decode frames from the extension. Page-content replies go straight to the
/// waiting session; everything else is queued for the main loop.
async fn read_requests<R>(
    mut reader: R,
    pages: ChannelPageSource,
    requests: mpsc::UnboundedSender<HostRequest>,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = native::read_frame(&mut reader).await? {
        let request: HostRequest = match serde_json::from_slice(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed request");
                continue;
            }
        };

        match request {
            HostRequest::PageContent { page, error } => pages.deliver(page, error),
            request => {
                if requests.send(request).is_err() {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Write every outbound event until all senders are gone.
async fn write_events<W>(mut writer: W, mut events: OutboxReceiver) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = events.recv().await {
        native::write_event(&mut writer, &event).await?;
    }
    Ok(())
}
