//! Finding producers - perception output into the ingestion channel
//!
//! The runtime tails a JSON-lines spool that the perception pipelines append
//! to. Each line is either a `ModalityFinding` or a free-text reasoning
//! assessment (`{"event_id": ..., "assessment": ...}`) which is scored by the
//! `KeywordAssessor`.
//!
//! With a `SpoolCheckpointStore` attached, the producer records how far the
//! ingestion loop has certainly consumed the spool and resumes there after a
//! restart. Lines still queued in the channel are never counted as consumed,
//! so a crash re-reads them instead of losing them.

use crate::fusion_core::error::ValidationError;
use crate::fusion_core::reasoning::KeywordAssessor;
use crate::fusion_core::types::{system_clock, Clock, ModalityFinding};
use crate::pipeline::checkpoint::{SpoolCheckpoint, SpoolCheckpointStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::sleep;

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

#[derive(Debug)]
pub enum ProducerError {
    Io(std::io::Error),
    Encoding(std::str::Utf8Error),
    Parse(ValidationError),
}

impl From<std::io::Error> for ProducerError {
    fn from(err: std::io::Error) -> Self {
        ProducerError::Io(err)
    }
}

impl From<ValidationError> for ProducerError {
    fn from(err: ValidationError) -> Self {
        ProducerError::Parse(err)
    }
}

impl std::fmt::Display for ProducerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProducerError::Io(e) => write!(f, "Spool IO error: {}", e),
            ProducerError::Encoding(e) => write!(f, "Spool line is not valid UTF-8: {}", e),
            ProducerError::Parse(e) => write!(f, "Spool parse error: {}", e),
        }
    }
}

impl std::error::Error for ProducerError {}

/// Source of findings feeding the ingestion loop
#[async_trait]
pub trait FindingProducer: Send {
    fn name(&self) -> &str;

    /// Push findings into `tx` until the source ends or the receiver closes
    async fn run(&mut self, tx: mpsc::Sender<ModalityFinding>) -> Result<(), ProducerError>;
}

/// Where a reader begins when the spool is first opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Beginning,
    End,
    /// Saved position; ignored when the spool was rotated or truncated since
    Resume(SpoolCheckpoint),
}

/// Asynchronous JSONL tail reader with rotation detection
pub struct SpoolTailReader {
    path: PathBuf,
    file: Option<BufReader<File>>,
    inode: Option<u64>,
    offset: u64,
    /// Buffered position may be ahead of `offset`
    resync: bool,
    start: StartPosition,
    poll_interval: Duration,
}

impl SpoolTailReader {
    pub fn new(path: PathBuf, start: StartPosition) -> Self {
        Self {
            path,
            file: None,
            inode: None,
            offset: 0,
            resync: false,
            start,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Byte offset just past the last line returned
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn checkpoint(&self) -> SpoolCheckpoint {
        SpoolCheckpoint {
            inode: self.inode,
            offset: self.offset,
        }
    }

    /// Start from `checkpoint` on the next `start` instead of the configured position
    pub fn resume_from(&mut self, checkpoint: SpoolCheckpoint) {
        self.start = StartPosition::Resume(checkpoint);
    }

    /// Open the spool and position the cursor
    pub async fn start(&mut self) -> std::io::Result<()> {
        self.open(self.start).await?;
        log::info!("📖 Started tailing spool: {} (byte {})", self.path.display(), self.offset);
        Ok(())
    }

    async fn open(&mut self, position: StartPosition) -> std::io::Result<()> {
        let file = File::open(&self.path).await?;
        let metadata = file.metadata().await?;

        #[cfg(unix)]
        {
            self.inode = Some(metadata.ino());
        }

        let mut reader = BufReader::new(file);
        self.offset = match position {
            StartPosition::Beginning => 0,
            StartPosition::End => reader.seek(SeekFrom::End(0)).await?,
            StartPosition::Resume(checkpoint) => {
                let same_file = checkpoint.inode.is_none() || checkpoint.inode == self.inode;
                if same_file && checkpoint.offset <= metadata.len() {
                    reader.seek(SeekFrom::Start(checkpoint.offset)).await?
                } else {
                    log::info!(
                        "🔄 Spool changed since byte {}, reading from the start: {}",
                        checkpoint.offset,
                        self.path.display()
                    );
                    0
                }
            }
        };
        self.resync = false;
        self.file = Some(reader);
        Ok(())
    }

    /// Read the next non-empty line as raw bytes, waiting for new data
    pub async fn read_raw_line(&mut self) -> std::io::Result<Vec<u8>> {
        loop {
            if self.detect_rotation().await? {
                log::info!("🔄 Spool rotation detected, reopening: {}", self.path.display());
                // A rotated spool is new data from its first byte
                self.open(StartPosition::Beginning).await?;
            }

            let reader = self.file.as_mut().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "Spool not opened")
            })?;

            if self.resync {
                reader.seek(SeekFrom::Start(self.offset)).await?;
            }

            // Stays set if this future is dropped mid-read
            self.resync = true;
            let mut line = Vec::new();
            let read = reader.read_until(b'\n', &mut line).await?;
            if read == 0 {
                self.resync = false;
                sleep(self.poll_interval).await;
                continue;
            }

            // Partial line: writer has not finished it yet
            if line.last() != Some(&b'\n') {
                sleep(self.poll_interval).await;
                continue;
            }

            self.resync = false;
            self.offset += read as u64;
            let trimmed = trim_line(&line);
            if !trimmed.is_empty() {
                return Ok(trimmed.to_vec());
            }
        }
    }

    /// Read the next non-empty line, waiting for new data.
    ///
    /// A line that is not UTF-8 yields `InvalidData`; the cursor is already
    /// past it, so the next call continues with the following line.
    pub async fn read_line(&mut self) -> std::io::Result<String> {
        let raw = self.read_raw_line().await?;
        String::from_utf8(raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    async fn detect_rotation(&self) -> std::io::Result<bool> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            // Rotated away and not yet recreated
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };

        #[cfg(unix)]
        {
            if self.inode.map_or(false, |old| old != metadata.ino()) {
                return Ok(true);
            }
        }

        // Truncated in place
        Ok(metadata.len() < self.offset)
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &line[start..end]
}

#[derive(Debug, Deserialize)]
struct AssessmentLine {
    event_id: String,
    assessment: String,
    #[serde(default)]
    received_at: Option<DateTime<Utc>>,
}

/// Parse one spool line into a finding.
///
/// Lines carrying an `assessment` field are free-text reasoning output and
/// go through `assessor`; everything else must be a `ModalityFinding`.
pub fn parse_spool_line(
    line: &str,
    assessor: &KeywordAssessor,
    now: DateTime<Utc>,
) -> Result<ModalityFinding, ProducerError> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| ValidationError::Malformed(e.to_string()))?;

    if value.get("assessment").is_some() {
        let parsed: AssessmentLine =
            serde_json::from_value(value).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        let received_at = parsed.received_at.unwrap_or(now);
        return Ok(assessor.assess(&parsed.event_id, &parsed.assessment, received_at));
    }

    Ok(ModalityFinding::from_value(value)?)
}

/// Tails the finding spool and forwards every parseable line
pub struct SpoolProducer {
    reader: SpoolTailReader,
    assessor: KeywordAssessor,
    checkpoints: Option<SpoolCheckpointStore>,
    now_fn: Clock,
}

impl SpoolProducer {
    pub fn new(reader: SpoolTailReader) -> Self {
        Self {
            reader,
            assessor: KeywordAssessor::new(),
            checkpoints: None,
            now_fn: system_clock(),
        }
    }

    pub fn with_assessor(mut self, assessor: KeywordAssessor) -> Self {
        self.assessor = assessor;
        self
    }

    /// Persist the consumed position and resume from it on the next run
    pub fn with_checkpoints(mut self, store: SpoolCheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    fn load_checkpoint(&mut self) {
        let Some(store) = &self.checkpoints else {
            return;
        };
        match store.load(self.reader.path()) {
            Ok(Some(checkpoint)) => {
                log::info!("📌 Resuming spool from byte {}", checkpoint.offset);
                self.reader.resume_from(checkpoint);
            }
            Ok(None) => {}
            Err(e) => log::warn!("⚠️  Could not load spool checkpoint, using start position: {}", e),
        }
    }

    fn save_checkpoint(&self, checkpoint: SpoolCheckpoint) {
        if let Some(store) = &self.checkpoints {
            if let Err(e) = store.save(self.reader.path(), checkpoint, (self.now_fn)()) {
                log::warn!("⚠️  Failed to save spool checkpoint: {}", e);
            }
        }
    }

    fn decode(&self, raw: Vec<u8>) -> Result<ModalityFinding, ProducerError> {
        let line = String::from_utf8(raw).map_err(|e| ProducerError::Encoding(e.utf8_error()))?;
        parse_spool_line(&line, &self.assessor, (self.now_fn)())
    }
}

#[async_trait]
impl FindingProducer for SpoolProducer {
    fn name(&self) -> &str {
        "spool"
    }

    async fn run(&mut self, tx: mpsc::Sender<ModalityFinding>) -> Result<(), ProducerError> {
        self.load_checkpoint();
        self.reader.start().await?;

        let mut committed = self.reader.checkpoint();
        self.save_checkpoint(committed);
        let mut uncommitted: VecDeque<SpoolCheckpoint> = VecDeque::new();
        let mut skipped = 0u64;

        loop {
            let raw = self.reader.read_raw_line().await?;
            let read_to = self.reader.checkpoint();

            match self.decode(raw) {
                Ok(finding) => {
                    if tx.send(finding).await.is_err() {
                        log::info!("🛑 Ingestion channel closed, stopping {} producer", self.name());
                        return Ok(());
                    }
                }
                Err(e) => {
                    skipped += 1;
                    log::warn!("⚠️  Skipping spool line ({} skipped so far): {}", skipped, e);
                }
            }

            if self.checkpoints.is_none() {
                continue;
            }

            // Queued lines plus the one being ingested are not consumed yet
            uncommitted.push_back(read_to);
            let unconsumed = tx.max_capacity() - tx.capacity() + 1;
            let mut next = committed;
            while uncommitted.len() > unconsumed {
                if let Some(checkpoint) = uncommitted.pop_front() {
                    next = checkpoint;
                }
            }
            if next != committed {
                committed = next;
                self.save_checkpoint(committed);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion_core::db::Database;
    use crate::fusion_core::types::Modality;
    use tokio::io::AsyncWriteExt;

    async fn append(path: &std::path::Path, text: &str) {
        append_bytes(path, text.as_bytes()).await;
    }

    async fn append_bytes(path: &std::path::Path, bytes: &[u8]) {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .unwrap();
        file.write_all(bytes).await.unwrap();
        file.flush().await.unwrap();
    }

    fn audio_line(event_id: &str) -> String {
        format!(
            "{{\"modality\":\"audio\",\"event_id\":\"{}\",\"confidence\":0.7,\"received_at\":\"2025-10-12T09:00:00Z\"}}\n",
            event_id
        )
    }

    async fn next_line(reader: &mut SpoolTailReader) -> String {
        tokio::time::timeout(Duration::from_secs(2), reader.read_line())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_tail_reader_starts_at_end() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("findings.jsonl");
        append(&path, "old1\nold2\n").await;

        let mut reader = SpoolTailReader::new(path.clone(), StartPosition::End)
            .with_poll_interval(Duration::from_millis(10));
        reader.start().await.unwrap();

        append(&path, "new1\n").await;
        assert_eq!(next_line(&mut reader).await, "new1");
    }

    #[tokio::test]
    async fn test_tail_reader_from_beginning_skips_blank_lines() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("findings.jsonl");
        append(&path, "a\n\n   \nb\n").await;

        let mut reader = SpoolTailReader::new(path, StartPosition::Beginning)
            .with_poll_interval(Duration::from_millis(10));
        reader.start().await.unwrap();

        assert_eq!(next_line(&mut reader).await, "a");
        assert_eq!(next_line(&mut reader).await, "b");
    }

    #[tokio::test]
    async fn test_tail_reader_waits_for_complete_line() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("findings.jsonl");
        append(&path, "").await;

        let mut reader = SpoolTailReader::new(path.clone(), StartPosition::End)
            .with_poll_interval(Duration::from_millis(10));
        reader.start().await.unwrap();

        append(&path, "{\"half\":").await;
        let pending = tokio::time::timeout(Duration::from_millis(100), reader.read_line()).await;
        assert!(pending.is_err());

        append(&path, "1}\n").await;
        assert_eq!(next_line(&mut reader).await, "{\"half\":1}");
    }

    #[tokio::test]
    async fn test_tail_reader_follows_truncation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("findings.jsonl");
        append(&path, "first line that is fairly long\n").await;

        let mut reader = SpoolTailReader::new(path.clone(), StartPosition::Beginning)
            .with_poll_interval(Duration::from_millis(10));
        reader.start().await.unwrap();
        assert_eq!(next_line(&mut reader).await, "first line that is fairly long");

        tokio::fs::write(&path, "x\n").await.unwrap();
        assert_eq!(next_line(&mut reader).await, "x");
    }

    #[tokio::test]
    async fn test_tail_reader_reports_invalid_utf8_and_moves_on() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("findings.jsonl");
        append_bytes(&path, b"\xff\xfe garbage\nok\n").await;

        let mut reader = SpoolTailReader::new(path, StartPosition::Beginning)
            .with_poll_interval(Duration::from_millis(10));
        reader.start().await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(2), reader.read_line())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        assert_eq!(next_line(&mut reader).await, "ok");
    }

    #[tokio::test]
    async fn test_tail_reader_resume_positions() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("findings.jsonl");
        append(&path, "seen\nunseen\n").await;

        let mut reader = SpoolTailReader::new(path.clone(), StartPosition::Beginning)
            .with_poll_interval(Duration::from_millis(10));
        reader.start().await.unwrap();
        assert_eq!(next_line(&mut reader).await, "seen");
        let saved = reader.checkpoint();
        assert_eq!(saved.offset, 5);

        let mut resumed = SpoolTailReader::new(path.clone(), StartPosition::End)
            .with_poll_interval(Duration::from_millis(10));
        resumed.resume_from(saved);
        resumed.start().await.unwrap();
        assert_eq!(next_line(&mut resumed).await, "unseen");

        // Offset past the end means the spool was truncated
        let mut truncated = SpoolTailReader::new(path.clone(), StartPosition::End)
            .with_poll_interval(Duration::from_millis(10));
        truncated.resume_from(SpoolCheckpoint {
            inode: saved.inode,
            offset: 10_000,
        });
        truncated.start().await.unwrap();
        assert_eq!(truncated.offset(), 0);
        assert_eq!(next_line(&mut truncated).await, "seen");

        #[cfg(unix)]
        {
            let mut rotated = SpoolTailReader::new(path, StartPosition::End)
                .with_poll_interval(Duration::from_millis(10));
            rotated.resume_from(SpoolCheckpoint {
                inode: saved.inode.map(|i| i.wrapping_add(1)),
                offset: saved.offset,
            });
            rotated.start().await.unwrap();
            assert_eq!(next_line(&mut rotated).await, "seen");
        }
    }

    #[test]
    fn test_parse_finding_line() {
        let line = r#"{"modality":"video","event_id":"evt-1","severity_indicators":[{"tag":"fall_posture","confidence":0.9}],"confidence":0.8,"raw_summary":"person on floor","received_at":"2025-10-12T09:00:00Z"}"#;
        let finding = parse_spool_line(line, &KeywordAssessor::new(), Utc::now()).unwrap();
        assert_eq!(finding.modality, Modality::Video);
        assert_eq!(finding.severity_indicators[0].tag, "fall_posture");
    }

    #[test]
    fn test_parse_assessment_line() {
        let line = r#"{"event_id":"evt-2","assessment":"The person has fallen and appears motionless."}"#;
        let now = Utc::now();
        let finding = parse_spool_line(line, &KeywordAssessor::new(), now).unwrap();
        assert_eq!(finding.modality, Modality::Reasoning);
        assert_eq!(finding.received_at, now);
        assert!(finding
            .severity_indicators
            .iter()
            .any(|i| i.tag == "fall_reported"));
    }

    #[test]
    fn test_parse_rejects_garbage_and_unknown_modality() {
        let assessor = KeywordAssessor::new();
        assert!(matches!(
            parse_spool_line("not json", &assessor, Utc::now()),
            Err(ProducerError::Parse(_))
        ));
        let line = r#"{"modality":"smell","event_id":"evt-3","confidence":0.5,"received_at":"2025-10-12T09:00:00Z"}"#;
        assert!(matches!(
            parse_spool_line(line, &assessor, Utc::now()),
            Err(ProducerError::Parse(ValidationError::UnknownModality(_)))
        ));
    }

    #[tokio::test]
    async fn test_spool_producer_forwards_and_skips_bad_lines() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("findings.jsonl");
        append(
            &path,
            concat!(
                "{\"event_id\":\"evt-4\",\"assessment\":\"all quiet\"}\n",
                "broken line\n",
                "{\"modality\":\"audio\",\"event_id\":\"evt-4\",\"confidence\":0.7,\"received_at\":\"2025-10-12T09:00:00Z\"}\n",
            ),
        )
        .await;

        let reader = SpoolTailReader::new(path, StartPosition::Beginning)
            .with_poll_interval(Duration::from_millis(10));
        let mut producer = SpoolProducer::new(reader);
        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(async move { producer.run(tx).await });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.modality, Modality::Reasoning);
        assert_eq!(second.modality, Modality::Audio);

        drop(rx);
        handle.abort();
    }

    #[tokio::test]
    async fn test_spool_producer_skips_non_utf8_line() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("findings.jsonl");
        append_bytes(&path, b"\xff\xfe garbage\n").await;
        append(&path, &audio_line("evt-5")).await;

        let reader = SpoolTailReader::new(path, StartPosition::Beginning)
            .with_poll_interval(Duration::from_millis(10));
        let mut producer = SpoolProducer::new(reader);
        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(async move { producer.run(tx).await });

        let finding = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(finding.event_id, "evt-5");
        assert!(!handle.is_finished());

        drop(rx);
        handle.abort();
    }

    #[tokio::test]
    async fn test_spool_producer_resumes_after_restart() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("findings.jsonl");
        let store = SpoolCheckpointStore::new(Database::open_in_memory().unwrap());
        append(&path, &audio_line("evt-a")).await;

        let reader = SpoolTailReader::new(path.clone(), StartPosition::End)
            .with_poll_interval(Duration::from_millis(10));
        let mut producer = SpoolProducer::new(reader).with_checkpoints(store.clone());
        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(async move { producer.run(tx).await });

        tokio::time::timeout(Duration::from_secs(2), async {
            while store.load(&path).unwrap().is_none() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        append(&path, &audio_line("evt-b")).await;
        append(&path, &audio_line("evt-c")).await;
        assert_eq!(rx.recv().await.unwrap().event_id, "evt-b");
        assert_eq!(rx.recv().await.unwrap().event_id, "evt-c");
        handle.abort();
        let _ = handle.await;

        // Written while the service was down
        append(&path, &audio_line("evt-d")).await;

        let reader = SpoolTailReader::new(path.clone(), StartPosition::End)
            .with_poll_interval(Duration::from_millis(10));
        let mut producer = SpoolProducer::new(reader).with_checkpoints(store.clone());
        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(async move { producer.run(tx).await });

        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(finding) = rx.recv().await {
                let done = finding.event_id == "evt-d";
                seen.push(finding.event_id);
                if done {
                    break;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(seen.last().map(String::as_str), Some("evt-d"));
        assert!(seen.iter().all(|id| id != "evt-a"));

        drop(rx);
        handle.abort();
    }
}
