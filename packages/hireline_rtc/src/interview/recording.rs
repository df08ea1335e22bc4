//! Interview recording: capture lifecycle, active-duration accounting and
//! the upload handoff.
//!
//! idle -> recording -> (paused <-> recording) -> stopped -> uploading ->
//! {uploaded | upload failed}. A failed upload keeps the blob; retrying is
//! the caller's decision.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{RecordingError, UploadError};
use crate::interview::media::MediaStream;
use crate::models::InterviewId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    Idle,
    Recording,
    Paused,
    Stopped,
    Uploading,
    Uploaded,
    UploadFailed,
}

impl RecordingState {
    fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Uploading => "uploading",
            Self::Uploaded => "uploaded",
            Self::UploadFailed => "upload_failed",
        }
    }
}

/// Finished recording handed to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingUpload {
    pub interview_id: InterviewId,
    pub data: Arc<[u8]>,
    pub mime_type: String,
    pub duration: Duration,
}

impl RecordingUpload {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub sent: u64,
    pub total: u64,
}

impl UploadProgress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.sent.min(self.total) * 100) / self.total) as u8
    }
}

/// A running capture that composes every source it was started with.
pub trait MediaRecorder: Send {
    fn pause(&mut self) -> Result<(), RecordingError>;
    fn resume(&mut self) -> Result<(), RecordingError>;
    /// Finalize and return the encoded blob.
    fn finish(self: Box<Self>) -> Result<Vec<u8>, RecordingError>;
}

pub trait RecorderFactory: Send + Sync + 'static {
    fn start(
        &self,
        sources: &[&MediaStream],
        mime_type: &str,
    ) -> Result<Box<dyn MediaRecorder>, RecordingError>;
}

pub struct RecordingController {
    factory: Arc<dyn RecorderFactory>,
    mime_type: String,
    progress_step: u8,
    state: RecordingState,
    interview_id: Option<InterviewId>,
    recorder: Option<Box<dyn MediaRecorder>>,
    /// Start of the current uninterrupted recording span.
    active_since: Option<Instant>,
    accumulated: Duration,
    upload: Option<RecordingUpload>,
    progress: u8,
    last_error: Option<UploadError>,
}

impl RecordingController {
    pub fn new(factory: Arc<dyn RecorderFactory>, mime_type: String, progress_step: u8) -> Self {
        Self {
            factory,
            mime_type,
            progress_step: progress_step.max(1),
            state: RecordingState::Idle,
            interview_id: None,
            recorder: None,
            active_since: None,
            accumulated: Duration::ZERO,
            upload: None,
            progress: 0,
            last_error: None,
        }
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn last_error(&self) -> Option<&UploadError> {
        self.last_error.as_ref()
    }

    /// The finished recording, kept until it is uploaded or discarded.
    pub fn upload(&self) -> Option<&RecordingUpload> {
        self.upload.as_ref()
    }

    /// Recorded time so far, paused spans excluded.
    pub fn duration(&self, now: Instant) -> Duration {
        let running = self
            .active_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default();
        self.accumulated + running
    }

    fn invalid(&self, action: &'static str) -> RecordingError {
        RecordingError::InvalidState(self.state.name(), action)
    }

    pub fn start(
        &mut self,
        interview_id: InterviewId,
        local: Option<&MediaStream>,
        remote: Option<&MediaStream>,
        now: Instant,
    ) -> Result<(), RecordingError> {
        if !matches!(self.state, RecordingState::Idle | RecordingState::Uploaded) {
            return Err(self.invalid("start"));
        }
        let sources: Vec<&MediaStream> = local.into_iter().chain(remote).collect();
        if sources.is_empty() {
            return Err(RecordingError::NoSource);
        }

        let recorder = self.factory.start(&sources, &self.mime_type)?;
        info!(interview = %interview_id, sources = sources.len(), "recording started");
        self.recorder = Some(recorder);
        self.interview_id = Some(interview_id);
        self.state = RecordingState::Recording;
        self.active_since = Some(now);
        self.accumulated = Duration::ZERO;
        self.upload = None;
        self.progress = 0;
        self.last_error = None;
        Ok(())
    }

    /// No-op unless recording. Returns whether the state changed.
    pub fn pause(&mut self, now: Instant) -> Result<bool, RecordingError> {
        if self.state != RecordingState::Recording {
            return Ok(false);
        }
        if let Some(recorder) = &mut self.recorder {
            recorder.pause()?;
        }
        if let Some(since) = self.active_since.take() {
            self.accumulated += now.saturating_duration_since(since);
        }
        self.state = RecordingState::Paused;
        Ok(true)
    }

    /// No-op unless paused.
    pub fn resume(&mut self, now: Instant) -> Result<bool, RecordingError> {
        if self.state != RecordingState::Paused {
            return Ok(false);
        }
        if let Some(recorder) = &mut self.recorder {
            recorder.resume()?;
        }
        self.active_since = Some(now);
        self.state = RecordingState::Recording;
        Ok(true)
    }

    /// Finalize the blob and move straight to uploading. The returned upload
    /// is what the caller sends to the backend.
    pub fn stop(&mut self, now: Instant) -> Result<RecordingUpload, RecordingError> {
        if !matches!(self.state, RecordingState::Recording | RecordingState::Paused) {
            return Err(self.invalid("stop"));
        }
        let duration = self.duration(now);
        self.active_since = None;
        self.accumulated = duration;

        let recorder = self.recorder.take().ok_or_else(|| self.invalid("stop"))?;
        let data = recorder.finish()?;
        let interview_id = self.interview_id.clone().ok_or_else(|| self.invalid("stop"))?;
        info!(
            interview = %interview_id,
            duration_secs = duration.as_secs(),
            size = data.len(),
            "recording stopped"
        );

        self.upload = Some(RecordingUpload {
            interview_id,
            data: Arc::from(data),
            mime_type: self.mime_type.clone(),
            duration,
        });
        self.state = RecordingState::Stopped;
        self.begin_upload()
    }

    fn begin_upload(&mut self) -> Result<RecordingUpload, RecordingError> {
        let upload = self.upload.clone().ok_or_else(|| self.invalid("upload"))?;
        self.state = RecordingState::Uploading;
        self.progress = 0;
        self.last_error = None;
        Ok(upload)
    }

    /// Returns the new percentage when it advanced by at least one step.
    pub fn on_progress(&mut self, progress: UploadProgress) -> Option<u8> {
        if self.state != RecordingState::Uploading {
            return None;
        }
        let percent = progress.percent();
        if percent >= 100 || percent >= self.progress.saturating_add(self.progress_step) {
            if percent > self.progress {
                self.progress = percent;
                return Some(percent);
            }
        }
        None
    }

    pub fn on_upload_finished(&mut self, result: Result<(), UploadError>) {
        if self.state != RecordingState::Uploading {
            return;
        }
        match result {
            Ok(()) => {
                info!("recording uploaded");
                self.state = RecordingState::Uploaded;
                self.progress = 100;
                self.upload = None;
            }
            Err(error) => {
                warn!(%error, "recording upload failed, blob retained");
                self.state = RecordingState::UploadFailed;
                self.last_error = Some(error);
            }
        }
    }

    /// One more upload attempt of the retained blob.
    pub fn retry_upload(&mut self) -> Result<RecordingUpload, RecordingError> {
        if self.state != RecordingState::UploadFailed {
            return Err(self.invalid("retry upload"));
        }
        self.begin_upload()
    }

    /// Drop a failed recording and go back to idle.
    pub fn discard(&mut self) {
        if let Some(recorder) = self.recorder.take() {
            if let Err(e) = recorder.finish() {
                warn!(error = %e, "recorder failed while discarding");
            }
        }
        self.state = RecordingState::Idle;
        self.active_since = None;
        self.accumulated = Duration::ZERO;
        self.upload = None;
        self.progress = 0;
    }
}
