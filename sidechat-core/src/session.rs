//! Sidebar session: the single owner of all mutable chat state.
//!
//! A `Session` turns user intents into completion requests, applies stream
//! events to the conversation, and reports everything the extension must show
//! through an [`Outbox`]. It is driven from one task only; the streaming work
//! runs elsewhere and reports back through [`StreamEvent`]s.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ChatRequest, ChatTransport};
use crate::attachments::{AttachBatch, AttachSource, IncomingFile, PendingImages};
use crate::config::Settings;
use crate::conversation::{Conversation, Message};
use crate::db::{Database, StoreError};
use crate::page::PageContentSource;
use crate::prompts::{self, QuickAction};
use crate::protocol::{HostEvent, HostRequest, Outbox, RenderedMessage, SettingsView};
use crate::stream::{self, Completion, RequestId, StreamEvent};

// =============================================================================
// Errors
// =============================================================================

/// Why a dispatch was refused. All of these are recovered locally.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("API key is not configured")]
    MissingCredential,

    #[error("no text is selected on the page")]
    NoSelection,

    #[error("failed to get page content: {0}")]
    PageContent(String),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl DispatchError {
    /// Toast text shown to the user.
    pub fn notice(&self) -> &'static str {
        match self {
            DispatchError::MissingCredential => "Please enter your Mistral API key first",
            DispatchError::NoSelection => "Please select text on the webpage first",
            DispatchError::PageContent(_) => "Failed to get page content",
            DispatchError::Storage(_) => "Failed to save to storage",
        }
    }
}

/// Outcome of an accepted dispatch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A completion request was started.
    Submitted(RequestId),
    /// Nothing to do: a response is in flight or the input was empty.
    Ignored,
}

// =============================================================================
// Session
// =============================================================================

struct InFlight {
    request_id: RequestId,
    cancel: CancellationToken,
}

/// Chat state for one sidebar.
pub struct Session {
    db: Database,
    settings: Settings,
    conversation: Conversation,
    pending: PendingImages,
    attach_batch: Option<AttachBatch>,
    in_flight: Option<InFlight>,
    next_request_id: RequestId,
    transport: Arc<dyn ChatTransport>,
    stream_events: stream::EventSender,
    outbox: Outbox,
}

impl Session {
    /// Create a session, loading settings and history from `db`.
    pub fn new(
        db: Database,
        transport: Arc<dyn ChatTransport>,
        stream_events: stream::EventSender,
        outbox: Outbox,
    ) -> Self {
        let settings = Settings::load(&db);
        let conversation = Conversation::load(&db);
        info!(
            messages = conversation.len(),
            model = %settings.model,
            has_api_key = settings.has_api_key(),
            "Session started"
        );
        Self {
            db,
            settings,
            conversation,
            pending: PendingImages::new(),
            attach_batch: None,
            in_flight: None,
            next_request_id: 1,
            transport,
            stream_events,
            outbox,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn pending_images(&self) -> &PendingImages {
        &self.pending
    }

    /// Whether a response is in flight.
    pub fn is_responding(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Full snapshot for a freshly opened panel: a `state` event followed by
    /// each stored message.
    pub fn snapshot(&self) -> Vec<HostEvent> {
        let state = HostEvent::State {
            pending_images: self.pending.previews(),
            settings: SettingsView::from(&self.settings),
            responding: self.is_responding(),
        };
        std::iter::once(state)
            .chain(self.conversation.messages().iter().map(|message| {
                HostEvent::MessageAppended {
                    message: RenderedMessage::from(message),
                }
            }))
            .collect()
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Send a user turn.
    ///
    /// Empty text with images is sent with a default instruction.
    pub fn send_user_text(
        &mut self,
        text: &str,
        images: Vec<String>,
    ) -> Result<Dispatch, DispatchError> {
        if self.is_responding() {
            return Ok(Dispatch::Ignored);
        }
        let text = text.trim();
        if text.is_empty() && images.is_empty() {
            return Ok(Dispatch::Ignored);
        }
        self.require_credential()?;

        let (visible, prompt) = if text.is_empty() {
            let (label, prompt) = prompts::image_only_prompts(images.len());
            (label.to_string(), prompt.to_string())
        } else {
            (text.to_string(), text.to_string())
        };
        Ok(self.submit_turn(visible, prompt, images))
    }

    /// Send the composer text with every pending image.
    ///
    /// The pending images are only drained once the send is accepted.
    pub fn send_pending(&mut self, text: &str) -> Result<Dispatch, DispatchError> {
        if self.is_responding() {
            return Ok(Dispatch::Ignored);
        }
        if text.trim().is_empty() && self.pending.is_empty() {
            return Ok(Dispatch::Ignored);
        }
        self.require_credential()?;

        let images = self.pending.take();
        self.emit_pending_images();
        self.send_user_text(text, images)
    }

    /// Run a quick action against the active page.
    pub async fn run_quick_action(
        &mut self,
        action: QuickAction,
        source: &dyn PageContentSource,
    ) -> Result<Dispatch, DispatchError> {
        if self.is_responding() {
            return Ok(Dispatch::Ignored);
        }
        self.require_credential()?;

        let page = source
            .page_content()
            .await
            .map_err(|e| DispatchError::PageContent(e.to_string()))?
            .normalized();

        if self.is_responding() {
            return Ok(Dispatch::Ignored);
        }

        let prompt =
            prompts::quick_action_prompt(action, &page).ok_or(DispatchError::NoSelection)?;
        debug!(?action, "Running quick action");
        Ok(self.submit_turn(prompt.clone(), prompt, Vec::new()))
    }

    /// Run an action picked from the page's context menu on `text`.
    pub fn handle_external_action(
        &mut self,
        action: QuickAction,
        text: &str,
    ) -> Result<Dispatch, DispatchError> {
        if self.is_responding() {
            return Ok(Dispatch::Ignored);
        }
        self.require_credential()?;
        if text.trim().is_empty() {
            return Err(DispatchError::NoSelection);
        }

        let prompt = prompts::context_menu_prompt(action, text);
        debug!(?action, "Running context-menu action");
        Ok(self.submit_turn(prompt.clone(), prompt, Vec::new()))
    }

    /// Start over: cancel any response, clear history and pending images.
    pub fn new_chat(&mut self) -> Result<(), DispatchError> {
        if let Some(in_flight) = self.in_flight.take() {
            info!(request_id = in_flight.request_id, "Cancelling in-flight request");
            in_flight.cancel.cancel();
            self.emit(HostEvent::StreamCancelled {
                request_id: in_flight.request_id,
            });
        }

        self.conversation.reset();
        self.pending.clear();
        self.emit(HostEvent::ConversationReset);
        self.emit_pending_images();
        self.emit(HostEvent::RespondingChanged { responding: false });

        self.conversation.persist(&self.db)?;
        Ok(())
    }

    /// Update and persist the credential and model.
    pub fn save_settings(&mut self, api_key: &str, model: &str) -> Result<(), DispatchError> {
        let mut settings = Settings {
            api_key: api_key.to_string(),
            model: model.to_string(),
        };
        settings.validate();
        settings.save(&self.db)?;
        info!(model = %settings.model, has_api_key = settings.has_api_key(), "Settings saved");
        self.settings = settings;
        Ok(())
    }

    pub fn attach_images(&mut self, source: AttachSource, files: Vec<IncomingFile>) {
        for notice in self.pending.attach(source, files) {
            self.emit(HostEvent::from(&notice));
        }
        self.emit_pending_images();
    }

    /// Add file `index` of a `count`-file batch. The batch is attached once
    /// its last file arrives; a file out of sequence discards the batch.
    pub fn attach_file(
        &mut self,
        source: AttachSource,
        index: usize,
        count: usize,
        file: IncomingFile,
    ) {
        if index == 0 {
            if let Some(stale) = self.attach_batch.take() {
                warn!(received = stale.received(), "Discarding incomplete attachment batch");
            }
            self.attach_batch = Some(AttachBatch::new(source, count));
        }

        let Some(batch) = self.attach_batch.as_mut() else {
            warn!(index, count, "Attachment arrived outside a batch");
            return;
        };
        if !batch.push(source, index, count, file) {
            warn!(index, count, received = batch.received(), "Attachment out of sequence");
            self.attach_batch = None;
            return;
        }

        if batch.is_complete() {
            if let Some(batch) = self.attach_batch.take() {
                let (source, files) = batch.into_parts();
                self.attach_images(source, files);
            }
        }
    }

    pub fn remove_image(&mut self, index: usize) {
        if self.pending.remove(index).is_some() {
            self.emit_pending_images();
        }
    }

    pub fn clear_images(&mut self) {
        self.pending.clear();
        self.emit_pending_images();
    }

    // =========================================================================
    // Stream events
    // =========================================================================

    /// Apply an event from the streaming task.
    ///
    /// Events that don't belong to the in-flight request are dropped.
    pub fn handle_stream_event(&mut self, event: StreamEvent) {
        let current = self.in_flight.as_ref().map(|f| f.request_id);
        if current != Some(event.request_id()) {
            debug!(request_id = event.request_id(), ?current, "Ignoring stale stream event");
            return;
        }

        match event {
            StreamEvent::Render { request_id, html } => {
                self.emit(HostEvent::StreamUpdate { request_id, html });
            }
            StreamEvent::Finished { content, .. } => {
                self.commit(Message::assistant(content));
            }
            StreamEvent::Failed { error, .. } => {
                self.commit(Message::error(&error.to_string()));
            }
            StreamEvent::Cancelled { request_id } => {
                self.in_flight = None;
                self.emit(HostEvent::StreamCancelled { request_id });
                self.emit(HostEvent::RespondingChanged { responding: false });
            }
        }
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Single entry point for extension requests.
    pub async fn handle(&mut self, request: HostRequest, page: &dyn PageContentSource) {
        let result = match request {
            HostRequest::Init => {
                for event in self.snapshot() {
                    self.emit(event);
                }
                Ok(())
            }
            HostRequest::SendMessage { text } => self.send_pending(&text).map(drop),
            HostRequest::AttachImage {
                source,
                index,
                count,
                file,
            } => {
                self.attach_file(source, index, count, file);
                Ok(())
            }
            HostRequest::RemoveImage { index } => {
                self.remove_image(index);
                Ok(())
            }
            HostRequest::ClearImages => {
                self.clear_images();
                Ok(())
            }
            HostRequest::QuickAction { action } => {
                self.run_quick_action(action, page).await.map(drop)
            }
            HostRequest::ContextMenuAction { action, text } => {
                match QuickAction::from_menu_id(&action) {
                    Some(action) => self.handle_external_action(action, &text).map(drop),
                    None => {
                        warn!(%action, "Unknown context-menu action");
                        Ok(())
                    }
                }
            }
            HostRequest::PageContent { .. } => {
                debug!("Page content arrived with no request waiting");
                Ok(())
            }
            HostRequest::NewChat => self.new_chat(),
            HostRequest::SaveSettings { api_key, model } => {
                match self.save_settings(&api_key, &model) {
                    Ok(()) => {
                        self.emit(HostEvent::notice("Settings saved successfully!", false));
                        Ok(())
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to save settings");
                        self.emit(HostEvent::error_notice("Failed to save settings"));
                        Ok(())
                    }
                }
            }
        };

        if let Err(e) = result {
            self.report(&e);
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn require_credential(&self) -> Result<(), DispatchError> {
        if self.settings.has_api_key() {
            Ok(())
        } else {
            Err(DispatchError::MissingCredential)
        }
    }

    /// Append the user turn and start its completion.
    fn submit_turn(&mut self, visible: String, prompt: String, images: Vec<String>) -> Dispatch {
        let request = ChatRequest::new(
            self.conversation.messages(),
            &prompt,
            &images,
            &self.settings,
        );

        let message = Message::user(visible, images);
        self.emit(HostEvent::MessageAppended {
            message: RenderedMessage::from(&message),
        });
        self.conversation.push(message);
        self.persist_conversation();

        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let cancel = CancellationToken::new();
        self.in_flight = Some(InFlight {
            request_id,
            cancel: cancel.clone(),
        });
        self.emit(HostEvent::RespondingChanged { responding: true });
        self.emit(HostEvent::Typing { request_id });

        stream::spawn_completion(
            Arc::clone(&self.transport),
            Completion {
                request_id,
                api_key: self.settings.api_key.clone(),
                request,
            },
            cancel,
            self.stream_events.clone(),
        );
        Dispatch::Submitted(request_id)
    }

    /// Append the assistant's final message and end the response.
    fn commit(&mut self, message: Message) {
        self.in_flight = None;
        self.emit(HostEvent::MessageAppended {
            message: RenderedMessage::from(&message),
        });
        self.conversation.push(message);
        self.persist_conversation();
        self.emit(HostEvent::RespondingChanged { responding: false });
    }

    fn persist_conversation(&self) {
        if let Err(e) = self.conversation.persist(&self.db) {
            warn!(error = %e, "Failed to save conversation history");
        }
    }

    fn report(&self, error: &DispatchError) {
        match error {
            DispatchError::MissingCredential => {
                self.emit(HostEvent::OpenSettings);
            }
            DispatchError::Storage(e) => warn!(error = %e, "Storage failure"),
            other => debug!(error = %other, "Dispatch refused"),
        }
        self.emit(HostEvent::error_notice(error.notice()));
    }

    fn emit_pending_images(&self) {
        self.emit(HostEvent::PendingImages {
            images: self.pending.previews(),
        });
    }

    fn emit(&self, event: HostEvent) {
        if self.outbox.send(event).is_err() {
            debug!("Outbox closed, dropping event");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::attachments::testing::noisy_png;
    use crate::attachments::MAX_PENDING_IMAGES;
    use crate::conversation::{Role, HISTORY_KEY};
    use crate::page::{PageContent, PageError};
    use crate::protocol::{outbox_channel, OutboxReceiver, MAX_EVENT_BYTES};
    use crate::stream::testing::{frame, ManualTransport, ScriptedTransport};
    use crate::stream::EventReceiver;
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use tempfile::TempDir;

    struct Harness {
        session: Session,
        events: EventReceiver,
        outbox: OutboxReceiver,
        _temp: TempDir,
    }

    impl Harness {
        fn new(transport: Arc<dyn ChatTransport>, api_key: &str) -> Self {
            let temp = TempDir::new().unwrap();
            let db = Database::open_at(temp.path().join("test.db")).unwrap();
            db.migrate().unwrap();
            Settings {
                api_key: api_key.to_string(),
                ..Settings::default()
            }
            .save(&db)
            .unwrap();

            let (stream_events, events) = stream::event_channel();
            let (outbox, outbox_rx) = outbox_channel();
            Self {
                session: Session::new(db, transport, stream_events, outbox),
                events,
                outbox: outbox_rx,
                _temp: temp,
            }
        }

        /// Feed stream events to the session until the response ends.
        async fn drain_response(&mut self) {
            while self.session.is_responding() {
                let event = self.events.recv().await.unwrap();
                self.session.handle_stream_event(event);
            }
        }

        fn sent(&mut self) -> Vec<HostEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.outbox.try_recv() {
                events.push(event);
            }
            events
        }

        fn stored_history(&self) -> Option<String> {
            self.session.db.get_raw(HISTORY_KEY).unwrap()
        }
    }

    struct StaticPage(Result<PageContent, PageError>);

    #[async_trait]
    impl PageContentSource for StaticPage {
        async fn page_content(&self) -> Result<PageContent, PageError> {
            self.0.clone()
        }
    }

    fn selection(text: &str) -> StaticPage {
        StaticPage(Ok(PageContent {
            title: "Page".to_string(),
            url: "https://example.com".to_string(),
            selected_text: text.to_string(),
            ..PageContent::default()
        }))
    }

    fn hello_transport() -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport::chunks(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n",
            "data: [DONE]\n",
        ]))
    }

    fn png_file(name: &str) -> IncomingFile {
        IncomingFile {
            name: name.to_string(),
            mime_type: "image/png".to_string(),
            data: STANDARD.encode([0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]),
        }
    }

    #[tokio::test]
    async fn test_streamed_response_is_committed() {
        let transport = hello_transport();
        let mut h = Harness::new(transport.clone(), "sk-test");

        let dispatch = h.session.send_user_text("Say hello", Vec::new()).unwrap();
        assert_eq!(dispatch, Dispatch::Submitted(1));
        assert!(h.session.is_responding());

        h.drain_response().await;

        let messages = h.session.conversation().messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "Say hello");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Hello");
        assert!(!messages[1].is_error);

        let reloaded = Conversation::load(&h.session.db);
        assert_eq!(reloaded.messages(), messages);
        assert_eq!(transport.calls(), 1);

        let sent = h.sent();
        assert!(sent.contains(&HostEvent::StreamUpdate {
            request_id: 1,
            html: "Hel".to_string()
        }));
        assert!(sent.contains(&HostEvent::StreamUpdate {
            request_id: 1,
            html: "Hello".to_string()
        }));
        assert_eq!(
            sent.last(),
            Some(&HostEvent::RespondingChanged { responding: false })
        );
    }

    #[tokio::test]
    async fn test_missing_credential_makes_no_network_call() {
        let transport = hello_transport();
        let mut h = Harness::new(transport.clone(), "");

        let err = h
            .session
            .run_quick_action(QuickAction::Summarize, &selection(""))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::MissingCredential));

        let err = h.session.send_user_text("hi", Vec::new()).unwrap_err();
        assert!(matches!(err, DispatchError::MissingCredential));

        let err = h
            .session
            .handle_external_action(QuickAction::Explain, "text")
            .unwrap_err();
        assert!(matches!(err, DispatchError::MissingCredential));

        assert_eq!(transport.calls(), 0);
        assert!(h.session.conversation().is_empty());
    }

    #[tokio::test]
    async fn test_missing_credential_request_opens_settings() {
        let transport = hello_transport();
        let mut h = Harness::new(transport.clone(), "");

        h.session
            .handle(
                HostRequest::QuickAction {
                    action: QuickAction::Summarize,
                },
                &selection(""),
            )
            .await;

        assert_eq!(
            h.sent(),
            vec![
                HostEvent::OpenSettings,
                HostEvent::error_notice("Please enter your Mistral API key first"),
            ]
        );
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_new_chat_mid_stream_commits_nothing() {
        let (transport, body) = ManualTransport::new();
        let mut h = Harness::new(Arc::new(transport), "sk-test");

        let Dispatch::Submitted(request_id) =
            h.session.send_user_text("Say hello", Vec::new()).unwrap()
        else {
            panic!("expected a submitted request");
        };

        body.send(Bytes::from(frame("Hel"))).unwrap();
        let event = h.events.recv().await.unwrap();
        assert_eq!(
            event,
            StreamEvent::Render {
                request_id,
                html: "Hel".to_string()
            }
        );
        h.session.handle_stream_event(event);

        h.session.new_chat().unwrap();
        assert!(!h.session.is_responding());

        // The task acknowledges the cancellation; the event is stale by now.
        let event = h.events.recv().await.unwrap();
        assert_eq!(event, StreamEvent::Cancelled { request_id });
        h.session.handle_stream_event(event);

        assert!(h.session.conversation().is_empty());
        assert_eq!(h.stored_history().as_deref(), Some("[]"));
        assert!(!h.sent().iter().any(|e| matches!(
            e,
            HostEvent::MessageAppended { message } if message.role == Role::Assistant
        )));
    }

    #[tokio::test]
    async fn test_dispatch_while_responding_is_ignored() {
        let (transport, _body) = ManualTransport::new();
        let mut h = Harness::new(Arc::new(transport), "sk-test");

        h.session.send_user_text("first", Vec::new()).unwrap();
        assert_eq!(
            h.session.send_user_text("second", Vec::new()).unwrap(),
            Dispatch::Ignored
        );
        assert_eq!(
            h.session
                .handle_external_action(QuickAction::Explain, "x")
                .unwrap(),
            Dispatch::Ignored
        );
        assert_eq!(
            h.session
                .run_quick_action(QuickAction::Summarize, &selection(""))
                .await
                .unwrap(),
            Dispatch::Ignored
        );
        assert_eq!(h.session.conversation().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_request_commits_error_message() {
        let transport = Arc::new(ScriptedTransport::rejecting(ApiError::Status {
            status: 401,
            message: "Unauthorized".to_string(),
        }));
        let mut h = Harness::new(transport, "sk-bad");

        h.session.send_user_text("hi", Vec::new()).unwrap();
        h.drain_response().await;

        let last = h.session.conversation().last().unwrap();
        assert!(last.is_error);
        assert_eq!(
            last.content,
            "Sorry, I encountered an error: Unauthorized. Please check your API key and try again."
        );
        assert_eq!(Conversation::load(&h.session.db).len(), 2);
    }

    #[tokio::test]
    async fn test_stale_events_are_ignored() {
        let transport = hello_transport();
        let mut h = Harness::new(transport, "sk-test");

        h.session.send_user_text("one", Vec::new()).unwrap();
        h.drain_response().await;

        h.session.handle_stream_event(StreamEvent::Finished {
            request_id: 1,
            content: "late".to_string(),
        });
        assert_eq!(h.session.conversation().len(), 2);
    }

    #[tokio::test]
    async fn test_quick_action_needs_selection() {
        let transport = hello_transport();
        let mut h = Harness::new(transport.clone(), "sk-test");

        let err = h
            .session
            .run_quick_action(QuickAction::Explain, &selection(""))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoSelection));
        assert_eq!(err.notice(), "Please select text on the webpage first");

        let dispatch = h
            .session
            .run_quick_action(QuickAction::Translate, &selection("Bonjour"))
            .await
            .unwrap();
        assert_eq!(dispatch, Dispatch::Submitted(1));
        h.drain_response().await;

        let first = &h.session.conversation().messages()[0];
        assert!(first.content.starts_with("Please translate the following text."));
        assert!(first.content.ends_with("\"Bonjour\""));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_quick_action_page_failure() {
        let transport = hello_transport();
        let mut h = Harness::new(transport.clone(), "sk-test");
        let page = StaticPage(Err(PageError::Unavailable("no content script".to_string())));

        let err = h
            .session
            .run_quick_action(QuickAction::Summarize, &page)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::PageContent(_)));
        assert_eq!(err.notice(), "Failed to get page content");
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_image_only_send_uses_default_prompt() {
        let transport = hello_transport();
        let mut h = Harness::new(transport.clone(), "sk-test");

        h.session
            .attach_images(AttachSource::Upload, vec![png_file("a.png"), png_file("b.png")]);
        assert_eq!(h.session.pending_images().len(), 2);

        h.session.send_pending("   ").unwrap();
        assert!(h.session.pending_images().is_empty());
        h.drain_response().await;

        let first = &h.session.conversation().messages()[0];
        assert_eq!(first.content, "Analyze these images");
        assert_eq!(first.images.len(), 2);

        let request = &transport.requests()[0];
        assert_eq!(request.model, crate::config::VISION_MODEL);
        let value = serde_json::to_value(request).unwrap();
        assert_eq!(
            value["messages"][0]["content"][0]["text"],
            "Please analyze these images and describe what you see."
        );
    }

    #[tokio::test]
    async fn test_send_pending_keeps_images_without_credential() {
        let transport = hello_transport();
        let mut h = Harness::new(transport, "");

        h.session
            .attach_images(AttachSource::Drop, vec![png_file("a.png")]);
        let err = h.session.send_pending("look").unwrap_err();
        assert!(matches!(err, DispatchError::MissingCredential));
        assert_eq!(h.session.pending_images().len(), 1);
    }

    #[tokio::test]
    async fn test_fourth_image_is_rejected() {
        let transport = hello_transport();
        let mut h = Harness::new(transport, "sk-test");

        let files = (0..MAX_PENDING_IMAGES)
            .map(|i| png_file(&format!("{i}.png")))
            .collect();
        h.session.attach_images(AttachSource::Upload, files);
        let before = h.session.pending_images().clone();
        h.sent();

        h.session
            .attach_images(AttachSource::Drop, vec![png_file("extra.png")]);
        assert_eq!(h.session.pending_images(), &before);
        assert_eq!(
            h.sent()[0],
            HostEvent::error_notice("Maximum 3 images allowed")
        );
    }

    #[tokio::test]
    async fn test_history_is_replayed_as_text() {
        let transport = hello_transport();
        let mut h = Harness::new(transport.clone(), "sk-test");

        h.session.send_user_text("first", Vec::new()).unwrap();
        h.drain_response().await;
        h.session.send_user_text("second", Vec::new()).unwrap();
        h.drain_response().await;

        let requests = transport.requests();
        assert_eq!(requests[1].messages.len(), 3);
        assert_eq!(h.session.conversation().len(), 4);
    }

    #[tokio::test]
    async fn test_save_settings_and_init_state() {
        let transport = hello_transport();
        let mut h = Harness::new(transport, "");

        h.session
            .handle(
                HostRequest::SaveSettings {
                    api_key: "  sk-new  ".to_string(),
                    model: "mistral-large-latest".to_string(),
                },
                &selection(""),
            )
            .await;
        assert_eq!(h.session.settings().api_key, "sk-new");
        assert_eq!(Settings::load(&h.session.db).model, "mistral-large-latest");

        h.session.handle(HostRequest::Init, &selection("")).await;
        let sent = h.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], HostEvent::notice("Settings saved successfully!", false));
        match &sent[1] {
            HostEvent::State {
                settings,
                responding,
                ..
            } => {
                assert_eq!(settings.model, "mistral-large-latest");
                assert!(!responding);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_snapshot_sends_one_event_per_message() {
        let mut h = Harness::new(hello_transport(), "sk-test");
        h.session.send_user_text("Say hello", Vec::new()).unwrap();
        h.drain_response().await;
        h.sent();

        h.session.handle(HostRequest::Init, &selection("")).await;
        let sent = h.sent();
        assert_eq!(sent.len(), 3);
        assert!(matches!(sent[0], HostEvent::State { .. }));
        let contents: Vec<&str> = sent[1..]
            .iter()
            .map(|event| match event {
                HostEvent::MessageAppended { message } => message.content.as_str(),
                other => panic!("unexpected event: {other:?}"),
            })
            .collect();
        assert_eq!(contents, vec!["Say hello", "Hello"]);
    }

    #[tokio::test]
    async fn test_large_image_events_fit_in_native_messages() {
        let transport = hello_transport();
        let mut h = Harness::new(transport.clone(), "sk-test");
        let bytes = noisy_png(600);
        assert!(bytes.len() > 900 * 1024);
        let file = IncomingFile {
            name: "photo.png".to_string(),
            mime_type: "image/png".to_string(),
            data: STANDARD.encode(&bytes),
        };

        h.session.attach_file(AttachSource::Upload, 0, 1, file);
        assert_eq!(h.session.pending_images().len(), 1);
        h.session.send_pending("What is this?").unwrap();
        h.drain_response().await;
        h.session.handle(HostRequest::Init, &selection("")).await;

        let sent = h.sent();
        assert!(sent
            .iter()
            .any(|e| matches!(e, HostEvent::PendingImages { images } if images.len() == 1)));
        for event in &sent {
            let size = serde_json::to_vec(event).unwrap().len();
            assert!(size <= MAX_EVENT_BYTES, "{size} byte event: {}", event_kind(event));
        }

        // The API still gets the full image.
        let value = serde_json::to_value(&transport.requests()[0]).unwrap();
        let sent_uri = value["messages"][0]["content"][1]["image_url"].as_str().unwrap();
        assert_eq!(sent_uri.len(), "data:image/png;base64,".len() + STANDARD.encode(&bytes).len());
        assert_eq!(Conversation::load(&h.session.db).messages()[0].images[0], sent_uri);
    }

    fn event_kind(event: &HostEvent) -> String {
        serde_json::to_value(event).unwrap()["type"].to_string()
    }

    #[tokio::test]
    async fn test_attach_file_waits_for_whole_batch() {
        let mut h = Harness::new(hello_transport(), "sk-test");

        h.session.attach_file(AttachSource::Drop, 0, 2, png_file("a.png"));
        assert!(h.session.pending_images().is_empty());
        assert!(h.sent().is_empty());

        h.session.attach_file(AttachSource::Drop, 1, 2, png_file("b.png"));
        assert_eq!(h.session.pending_images().len(), 2);
        assert_eq!(h.sent()[0], HostEvent::notice("2 image(s) added", false));
    }

    #[tokio::test]
    async fn test_attach_file_out_of_sequence_drops_batch() {
        let mut h = Harness::new(hello_transport(), "sk-test");

        h.session.attach_file(AttachSource::Upload, 0, 3, png_file("a.png"));
        h.session.attach_file(AttachSource::Upload, 2, 3, png_file("c.png"));
        h.session.attach_file(AttachSource::Upload, 1, 3, png_file("b.png"));
        assert!(h.session.pending_images().is_empty());

        // A new batch starts cleanly after a broken one.
        h.session.attach_file(AttachSource::Upload, 0, 4, png_file("a.png"));
        h.session.attach_file(AttachSource::Upload, 0, 1, png_file("z.png"));
        assert_eq!(h.session.pending_images().len(), 1);
    }

    #[tokio::test]
    async fn test_context_menu_request() {
        let transport = hello_transport();
        let mut h = Harness::new(transport.clone(), "sk-test");

        h.session
            .handle(
                HostRequest::ContextMenuAction {
                    action: "ai-summarize".to_string(),
                    text: "long article".to_string(),
                },
                &selection(""),
            )
            .await;
        h.drain_response().await;

        assert_eq!(
            h.session.conversation().messages()[0].content,
            "Please summarize the following text:\n\n\"long article\""
        );

        h.session
            .handle(
                HostRequest::ContextMenuAction {
                    action: "ai-unknown".to_string(),
                    text: "x".to_string(),
                },
                &selection(""),
            )
            .await;
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_session_restores_history() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("test.db");
        {
            let db = Database::open_at(path.clone()).unwrap();
            db.migrate().unwrap();
            let mut conversation = Conversation::new();
            conversation.push(Message::user("earlier", Vec::new()));
            conversation.persist(&db).unwrap();
        }

        let db = Database::open_at(path).unwrap();
        db.migrate().unwrap();
        let (stream_events, _events) = stream::event_channel();
        let (outbox, _outbox_rx) = outbox_channel();
        let session = Session::new(db, hello_transport(), stream_events, outbox);

        assert_eq!(session.conversation().len(), 1);
        assert_eq!(session.settings(), &Settings::default());
    }
}
