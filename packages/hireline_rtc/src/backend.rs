//! Request/response collaborators: conversation listing, message history,
//! read marking and recording upload.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::directory::{ConversationPage, ConversationQuery};
use crate::interview::{RecordingUpload, UploadProgress};
use crate::messages::MessagePage;
use crate::models::{ConversationId, Message};

pub trait Backend: Send + Sync + 'static {
    fn fetch_conversations(
        &self,
        query: ConversationQuery,
    ) -> BoxFuture<'static, anyhow::Result<ConversationPage>>;

    /// History page `page` (1-based), newest first.
    fn fetch_messages(
        &self,
        conversation: ConversationId,
        page: u32,
        limit: u32,
    ) -> BoxFuture<'static, anyhow::Result<MessagePage>>;

    /// Every message sent strictly after `after`, any order.
    fn fetch_messages_since(
        &self,
        conversation: ConversationId,
        after: DateTime<Utc>,
    ) -> BoxFuture<'static, anyhow::Result<Vec<Message>>>;

    fn mark_as_read(&self, conversation: ConversationId) -> BoxFuture<'static, anyhow::Result<()>>;

    /// Multipart upload. Progress is reported on `progress` as bytes go out.
    fn upload_recording(
        &self,
        upload: RecordingUpload,
        progress: mpsc::UnboundedSender<UploadProgress>,
    ) -> BoxFuture<'static, anyhow::Result<()>>;
}
