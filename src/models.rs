use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

/// Helper to deserialize `null` and blank strings as `None`.
///
/// The worker reports `""` for rate/eta while a transfer is warming up.
fn deserialize_blank_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer).unwrap_or(None);
    Ok(value.filter(|s| !s.trim().is_empty()))
}

/// Lifecycle status of a job as reported by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    /// The worker calls this `downloading`.
    #[serde(alias = "downloading")]
    Running,
    /// Post-processing (merge, audio extraction) after the transfer finished.
    Processing,
    Complete,
    Error,
    #[serde(alias = "canceled")]
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses are final: nothing follows them for a job id.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Error | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// One status record for a job, as listed by the worker's progress endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    #[serde(alias = "downloadId")]
    pub job_id: String,
    pub status: JobStatus,
    /// 0..=100
    #[serde(default, deserialize_with = "deserialize_progress")]
    pub progress: f64,
    #[serde(
        default,
        alias = "speed",
        deserialize_with = "deserialize_blank_as_none"
    )]
    pub rate: Option<String>,
    #[serde(default, deserialize_with = "deserialize_blank_as_none")]
    pub eta: Option<String>,
    #[serde(default, deserialize_with = "deserialize_blank_as_none")]
    pub filename: Option<String>,
    #[serde(default, deserialize_with = "deserialize_blank_as_none")]
    pub error: Option<String>,
}

fn deserialize_progress<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer).unwrap_or(None);
    Ok(value
        .filter(|p| p.is_finite())
        .map(|p| p.clamp(0.0, 100.0))
        .unwrap_or(0.0))
}

impl JobRecord {
    pub fn new(job_id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            progress: 0.0,
            rate: None,
            eta: None,
            filename: None,
            error: None,
        }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = progress.clamp(0.0, 100.0);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// What to extract from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    #[default]
    Video,
    Audio,
}

impl DownloadMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadMode::Video => "video",
            DownloadMode::Audio => "audio",
        }
    }
}

/// Host-side request to start a download job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadOptions {
    pub url: String,
    pub output_dir: String,
    #[serde(default)]
    pub mode: DownloadMode,
    /// Container (video mode, e.g. `mp4`) or codec (audio mode, e.g. `mp3`).
    #[serde(default)]
    pub format: Option<String>,
    /// `best`, `1080p`, ...
    #[serde(default)]
    pub quality: Option<String>,
    /// `HH:MM:SS`
    #[serde(default)]
    pub start_time: Option<String>,
    /// `HH:MM:SS`
    #[serde(default)]
    pub end_time: Option<String>,
}

impl DownloadOptions {
    pub fn new(url: impl Into<String>, output_dir: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            output_dir: output_dir.into(),
            mode: DownloadMode::Video,
            format: None,
            quality: None,
            start_time: None,
            end_time: None,
        }
    }

    /// Body for `POST /api/download/start`.
    ///
    /// The worker takes separate `videoFormat`/`audioFormat` keys and applies
    /// its own defaults for anything left out.
    pub fn to_request_body(&self) -> Value {
        let mut body = json!({
            "url": self.url,
            "outputDir": self.output_dir,
            "mode": self.mode.as_str(),
        });

        if let Some(format) = &self.format {
            let key = match self.mode {
                DownloadMode::Video => "videoFormat",
                DownloadMode::Audio => "audioFormat",
            };
            body[key] = json!(format);
        }
        if let Some(quality) = &self.quality {
            body["quality"] = json!(quality);
        }
        if let Some(start) = &self.start_time {
            body["startTime"] = json!(start);
        }
        if let Some(end) = &self.end_time {
            body["endTime"] = json!(end);
        }

        body
    }
}

/// Response of `POST /api/download/start`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StartedJob {
    #[serde(alias = "downloadId")]
    pub job_id: String,
}

/// Metadata for a piece of content, fetched without downloading it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoInfo {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub thumbnail: Option<String>,
    /// Seconds.
    pub duration: Option<f64>,
    pub channel: Option<String>,
    /// `YYYYMMDD`
    pub upload_date: Option<String>,
    pub view_count: Option<u64>,
    pub available_qualities: Vec<String>,
    pub available_video_formats: Vec<String>,
    pub available_audio_formats: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_record_aliases() {
        let raw = r#"{
            "downloadId": "7f3c",
            "status": "downloading",
            "progress": 42.5,
            "speed": "1.50MiB/s",
            "eta": "00:30",
            "filename": "",
            "error": null
        }"#;
        let record: JobRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.job_id, "7f3c");
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.progress, 42.5);
        assert_eq!(record.rate.as_deref(), Some("1.50MiB/s"));
        assert_eq!(record.eta.as_deref(), Some("00:30"));
        assert!(record.filename.is_none());
        assert!(record.error.is_none());
    }

    #[test]
    fn test_progress_is_clamped() {
        let record: JobRecord =
            serde_json::from_str(r#"{"jobId": "a", "status": "running", "progress": 180}"#)
                .unwrap();
        assert_eq!(record.progress, 100.0);

        let record: JobRecord =
            serde_json::from_str(r#"{"jobId": "a", "status": "pending", "progress": null}"#)
                .unwrap();
        assert_eq!(record.progress, 0.0);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Complete.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn test_request_body_audio_mode() {
        let mut options = DownloadOptions::new("https://youtu.be/abc", "/tmp/out");
        options.mode = DownloadMode::Audio;
        options.format = Some("flac".into());
        options.start_time = Some("00:01:00".into());

        let body = options.to_request_body();
        assert_eq!(body["mode"], "audio");
        assert_eq!(body["audioFormat"], "flac");
        assert_eq!(body["outputDir"], "/tmp/out");
        assert_eq!(body["startTime"], "00:01:00");
        assert!(body.get("videoFormat").is_none());
        assert!(body.get("endTime").is_none());
    }

    #[test]
    fn test_video_info_tolerates_missing_fields() {
        let info: VideoInfo = serde_json::from_str(
            r#"{"id": "abc", "title": "Demo", "duration": 212, "availableQualities": ["best", "720p"]}"#,
        )
        .unwrap();
        assert_eq!(info.title, "Demo");
        assert_eq!(info.duration, Some(212.0));
        assert_eq!(info.available_qualities, vec!["best", "720p"]);
        assert!(info.channel.is_none());
    }
}
