//! Page-content round trip through the extension.
//!
//! The session asks for page content by emitting `get-page-content` and
//! waiting; the stdin reader hands the `page-content` reply to the waiter.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sidechat_core::{HostEvent, Outbox, PageContent, PageContentSource, PageError};
use tokio::sync::oneshot;
use tracing::debug;

/// How long to wait for the extension to answer.
pub const PAGE_CONTENT_TIMEOUT: Duration = Duration::from_secs(10);

type Reply = Result<PageContent, PageError>;

/// [`PageContentSource`] answered by `page-content` messages from stdin.
#[derive(Clone)]
pub struct ChannelPageSource {
    waiter: Arc<Mutex<Option<oneshot::Sender<Reply>>>>,
    outbox: Outbox,
}

impl ChannelPageSource {
    pub fn new(outbox: Outbox) -> Self {
        Self {
            waiter: Arc::new(Mutex::new(None)),
            outbox,
        }
    }

    /// Hand a reply to the pending request, if any.
    pub fn deliver(&self, page: Option<PageContent>, error: Option<String>) {
        let reply = match (page, error) {
            (_, Some(error)) => Err(PageError::Unavailable(error)),
            (page, None) => Ok(page.unwrap_or_default()),
        };

        let waiter = self.waiter.lock().ok().and_then(|mut slot| slot.take());
        match waiter {
            Some(sender) => {
                if sender.send(reply).is_err() {
                    debug!("Page-content requester went away");
                }
            }
            None => debug!("Unsolicited page content, dropping"),
        }
    }

    fn clear_waiter(&self) {
        if let Ok(mut slot) = self.waiter.lock() {
            slot.take();
        }
    }
}

#[async_trait]
impl PageContentSource for ChannelPageSource {
    async fn page_content(&self) -> Result<PageContent, PageError> {
        let (sender, receiver) = oneshot::channel();
        {
            let mut slot = self
                .waiter
                .lock()
                .map_err(|_| PageError::Unavailable("page bridge poisoned".to_string()))?;
            if slot.replace(sender).is_some() {
                debug!("Replacing an unanswered page-content request");
            }
        }

        if self.outbox.send(HostEvent::GetPageContent).is_err() {
            self.clear_waiter();
            return Err(PageError::Unavailable("extension disconnected".to_string()));
        }

        match tokio::time::timeout(PAGE_CONTENT_TIMEOUT, receiver).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(PageError::Unavailable("request dropped".to_string())),
            Err(_) => {
                self.clear_waiter();
                Err(PageError::Unavailable("timed out".to_string()))
            }
        }
    }
}
