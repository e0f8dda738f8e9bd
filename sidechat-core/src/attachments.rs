//! Pending image attachments for the next outgoing message.
//!
//! The extension sends picked or dropped files as base64 payloads, one file
//! per message, and the host reassembles the batch. Each file is checked on
//! its own; a bad file produces a notice and the rest of the batch continues.
//!
//! Full images stay on the host. The extension only ever sees previews.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::{ImageFormat, ImageReader};
use serde::{Deserialize, Serialize};

/// Maximum number of images on one message.
pub const MAX_PENDING_IMAGES: usize = 3;

/// Maximum decoded size of a single image.
pub const MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;

/// Longest side of a preview thumbnail.
const THUMBNAIL_SIZE: u32 = 128;

/// Images whose data URI is at most this long are their own preview.
const MAX_INLINE_PREVIEW_BYTES: usize = 48 * 1024;

/// How the files reached the sidebar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachSource {
    /// File picker. Slots are assigned before type checks.
    Upload,
    /// Drag and drop. Non-images are filtered out first.
    Drop,
}

/// A file as delivered by the extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingFile {
    pub name: String,
    /// Browser-reported type. May be empty, in which case it is sniffed.
    #[serde(default)]
    pub mime_type: String,
    /// Base64 file contents.
    pub data: String,
}

impl IncomingFile {
    fn declared_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// User-facing outcome of an attach attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachNotice {
    /// All slots were already taken; nothing was added.
    CapacityReached,
    /// Dropped files contained no image at all.
    NoImagesDropped,
    NotAnImage { name: String },
    TooLarge { name: String },
    Unreadable { name: String },
    /// More files than free slots; only `slots` were considered.
    Truncated { slots: usize },
    Added { count: usize },
}

impl AttachNotice {
    pub fn message(&self) -> String {
        match self {
            AttachNotice::CapacityReached => {
                format!("Maximum {MAX_PENDING_IMAGES} images allowed")
            }
            AttachNotice::NoImagesDropped => "Please drop image files only".to_string(),
            AttachNotice::NotAnImage { name } => format!("{name} is not an image"),
            AttachNotice::TooLarge { name } => format!("{name} is too large (max 20MB)"),
            AttachNotice::Unreadable { name } => format!("{name} could not be read"),
            AttachNotice::Truncated { slots } => {
                format!("Only {slots} image(s) added (max {MAX_PENDING_IMAGES} total)")
            }
            AttachNotice::Added { count } => format!("{count} image(s) added"),
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, AttachNotice::Truncated { .. } | AttachNotice::Added { .. })
    }
}

/// An accepted image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingImage {
    /// Full image as a `data:` URI, sent to the API.
    pub uri: String,
    /// Thumbnail shown in the composer. Empty when none could be made.
    pub preview: String,
}

/// Images waiting for the next send. Never holds more than three.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingImages {
    images: Vec<PendingImage>,
}

impl PendingImages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and add a batch of files.
    pub fn attach(&mut self, source: AttachSource, files: Vec<IncomingFile>) -> Vec<AttachNotice> {
        let mut notices = Vec::new();

        let candidates: Vec<IncomingFile> = match source {
            AttachSource::Upload => files,
            AttachSource::Drop => {
                let images: Vec<IncomingFile> =
                    files.into_iter().filter(IncomingFile::declared_image).collect();
                if images.is_empty() {
                    notices.push(AttachNotice::NoImagesDropped);
                    return notices;
                }
                images
            }
        };
        if candidates.is_empty() {
            return notices;
        }

        let slots = self.remaining();
        if slots == 0 {
            notices.push(AttachNotice::CapacityReached);
            return notices;
        }

        let truncated = candidates.len() > slots;
        let mut added = 0;
        for file in candidates.into_iter().take(slots) {
            match to_data_uri(&file) {
                Ok(uri) => {
                    tracing::debug!(name = %file.name, bytes = uri.len(), "Attached image");
                    let preview = preview_uri(&uri);
                    self.images.push(PendingImage { uri, preview });
                    added += 1;
                }
                Err(notice) => {
                    tracing::debug!(name = %file.name, reason = %notice.message(), "Rejected image");
                    notices.push(notice);
                }
            }
        }

        if truncated {
            notices.push(AttachNotice::Truncated { slots });
        } else if added > 0 {
            notices.push(AttachNotice::Added { count: added });
        }
        notices
    }

    /// Remove the image at `index`. Out-of-range indices are ignored.
    pub fn remove(&mut self, index: usize) -> Option<PendingImage> {
        (index < self.images.len()).then(|| self.images.remove(index))
    }

    pub fn clear(&mut self) {
        self.images.clear();
    }

    /// Drain all images for sending, as full `data:` URIs.
    pub fn take(&mut self) -> Vec<String> {
        std::mem::take(&mut self.images)
            .into_iter()
            .map(|image| image.uri)
            .collect()
    }

    pub fn as_slice(&self) -> &[PendingImage] {
        &self.images
    }

    pub fn previews(&self) -> Vec<String> {
        self.images.iter().map(|image| image.preview.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn remaining(&self) -> usize {
        MAX_PENDING_IMAGES.saturating_sub(self.images.len())
    }
}

/// Decode, check and re-encode one file as a `data:` URI.
fn to_data_uri(file: &IncomingFile) -> Result<String, AttachNotice> {
    let bytes = STANDARD
        .decode(file.data.trim())
        .map_err(|_| AttachNotice::Unreadable {
            name: file.name.clone(),
        })?;

    let mime = if file.mime_type.is_empty() {
        image::guess_format(&bytes)
            .map(|format| format.to_mime_type().to_string())
            .unwrap_or_default()
    } else {
        file.mime_type.clone()
    };
    if !mime.starts_with("image/") {
        return Err(AttachNotice::NotAnImage {
            name: file.name.clone(),
        });
    }

    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(AttachNotice::TooLarge {
            name: file.name.clone(),
        });
    }

    Ok(format!("data:{mime};base64,{}", STANDARD.encode(&bytes)))
}

// =============================================================================
// Previews
// =============================================================================

/// Small stand-in for an image `data:` URI, safe to send to the extension.
///
/// Small images are returned as they are. Larger ones are scaled down to a
/// PNG thumbnail; if that fails the preview is empty.
pub fn preview_uri(uri: &str) -> String {
    if uri.len() <= MAX_INLINE_PREVIEW_BYTES {
        return uri.to_string();
    }
    match thumbnail(uri) {
        Ok(preview) => preview,
        Err(e) => {
            tracing::debug!(error = %e, bytes = uri.len(), "No preview for image");
            String::new()
        }
    }
}

fn thumbnail(uri: &str) -> anyhow::Result<String> {
    let (_, payload) = uri
        .split_once(";base64,")
        .ok_or_else(|| anyhow::anyhow!("not a base64 data URI"))?;
    let bytes = STANDARD.decode(payload)?;

    let img = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .decode()?;
    let thumb = img.thumbnail(THUMBNAIL_SIZE, THUMBNAIL_SIZE);

    let mut buffer = Vec::new();
    thumb.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)?;
    Ok(format!("data:image/png;base64,{}", STANDARD.encode(&buffer)))
}

// =============================================================================
// Batches
// =============================================================================

/// Files of one pick or drop, arriving one message at a time.
#[derive(Debug)]
pub struct AttachBatch {
    source: AttachSource,
    count: usize,
    files: Vec<IncomingFile>,
}

impl AttachBatch {
    pub fn new(source: AttachSource, count: usize) -> Self {
        Self {
            source,
            count,
            files: Vec::new(),
        }
    }

    /// Add file `index` of `count`. Returns `false`, leaving the batch
    /// unchanged, when the file doesn't continue this batch.
    pub fn push(
        &mut self,
        source: AttachSource,
        index: usize,
        count: usize,
        file: IncomingFile,
    ) -> bool {
        if source != self.source || count != self.count || index != self.files.len() {
            return false;
        }
        self.files.push(file);
        true
    }

    pub fn received(&self) -> usize {
        self.files.len()
    }

    pub fn is_complete(&self) -> bool {
        self.files.len() >= self.count
    }

    pub fn into_parts(self) -> (AttachSource, Vec<IncomingFile>) {
        (self.source, self.files)
    }
}
