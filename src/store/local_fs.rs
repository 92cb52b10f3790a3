use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use super::{
    AlignmentLockOutcome, AlignmentRecord, AlignmentStatus, CanonicalGuideRecord, ExplanationKey,
    ExplanationRecord, GuideBegin, GuideChunkRecord, GuideStatus, GuideStore,
};

/// Filesystem-backed store: one JSON document per record, written via
/// temp-file-then-rename so readers never observe partial writes.
///
/// Conditional transactions are serialized by an in-process mutex; the
/// cross-process transactionality of the real document database is out
/// of scope for this backend.
#[derive(Debug)]
pub struct LocalFsStore {
    base_dir: PathBuf,
    txn: Mutex<()>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProgressDoc {
    done: usize,
    total: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ControlDoc {
    cancelled: bool,
}

impl LocalFsStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            txn: Mutex::new(()),
        }
    }

    fn alignment_path(&self, key: &str) -> PathBuf {
        self.base_dir.join("alignments").join(format!("{key}.json"))
    }

    fn explanation_path(&self, key: &ExplanationKey) -> PathBuf {
        self.base_dir.join(format!("{}.json", key.archive_path()))
    }

    fn legacy_path(&self, hash_key: &str) -> PathBuf {
        self.base_dir
            .join("explanation-cache-legacy")
            .join(format!("{hash_key}.json"))
    }

    fn guide_path(&self, fingerprint: &str) -> PathBuf {
        self.base_dir
            .join("canonical-guides")
            .join(format!("{fingerprint}.json"))
    }

    fn guide_chunks_path(&self, fingerprint: &str) -> PathBuf {
        self.base_dir
            .join("canonical-guides")
            .join(fingerprint)
            .join("chunks.json")
    }

    fn progress_path(&self, scope: &str) -> PathBuf {
        self.base_dir.join("progress").join(format!("{scope}.json"))
    }

    fn control_path(&self, scope: &str) -> PathBuf {
        self.base_dir.join("control").join(format!("{scope}.json"))
    }
}

#[async_trait]
impl GuideStore for LocalFsStore {
    async fn get_alignment(&self, key: &str) -> anyhow::Result<Option<AlignmentRecord>> {
        read_json(&self.alignment_path(key)).await
    }

    async fn try_lock_alignment(
        &self,
        key: &str,
        lock_ttl: Duration,
    ) -> anyhow::Result<AlignmentLockOutcome> {
        let _guard = self.txn.lock().await;
        let now = Utc::now();
        let path = self.alignment_path(key);

        if let Some(existing) = read_json::<AlignmentRecord>(&path).await?
            && existing.status == AlignmentStatus::Building
            && !existing.lock_expired(now)
        {
            return Ok(AlignmentLockOutcome::Busy(existing));
        }

        write_json_atomic(&path, &AlignmentRecord::building(now, lock_ttl)).await?;
        Ok(AlignmentLockOutcome::Acquired)
    }

    async fn put_alignment(&self, key: &str, record: &AlignmentRecord) -> anyhow::Result<()> {
        write_json_atomic(&self.alignment_path(key), record).await
    }

    async fn touch_alignment_checked(&self, key: &str) -> anyhow::Result<()> {
        let _guard = self.txn.lock().await;
        let path = self.alignment_path(key);
        let Some(mut record) = read_json::<AlignmentRecord>(&path).await? else {
            return Ok(());
        };
        record.source_checked_at = Utc::now();
        write_json_atomic(&path, &record).await
    }

    async fn get_explanation(
        &self,
        key: &ExplanationKey,
    ) -> anyhow::Result<Option<ExplanationRecord>> {
        read_json(&self.explanation_path(key)).await
    }

    async fn put_explanation(
        &self,
        key: &ExplanationKey,
        record: &ExplanationRecord,
    ) -> anyhow::Result<()> {
        write_json_atomic(&self.explanation_path(key), record).await
    }

    async fn get_legacy_explanation(
        &self,
        hash_key: &str,
    ) -> anyhow::Result<Option<ExplanationRecord>> {
        read_json(&self.legacy_path(hash_key)).await
    }

    async fn put_legacy_explanation(
        &self,
        hash_key: &str,
        record: &ExplanationRecord,
    ) -> anyhow::Result<()> {
        write_json_atomic(&self.legacy_path(hash_key), record).await
    }

    async fn begin_guide(
        &self,
        fingerprint: &str,
        skeleton: &CanonicalGuideRecord,
        staleness: Duration,
    ) -> anyhow::Result<GuideBegin> {
        let _guard = self.txn.lock().await;
        let now = Utc::now();
        let path = self.guide_path(fingerprint);

        match read_json::<CanonicalGuideRecord>(&path).await? {
            Some(existing) if existing.status == GuideStatus::Ready => {
                let chunks = read_json::<Vec<GuideChunkRecord>>(&self.guide_chunks_path(fingerprint))
                    .await?
                    .unwrap_or_default();
                return Ok(GuideBegin::Ready(Box::new((existing, chunks))));
            }
            Some(existing) if existing.status == GuideStatus::Processing => {
                let age = now.signed_duration_since(existing.updated_at);
                let stale = age.to_std().map(|age| age >= staleness).unwrap_or(false);
                if !stale {
                    return Ok(GuideBegin::Processing);
                }
            }
            _ => {}
        }

        write_json_atomic(&path, skeleton).await?;
        Ok(GuideBegin::Acquired)
    }

    async fn get_guide(
        &self,
        fingerprint: &str,
    ) -> anyhow::Result<Option<(CanonicalGuideRecord, Vec<GuideChunkRecord>)>> {
        let Some(record) = read_json::<CanonicalGuideRecord>(&self.guide_path(fingerprint)).await?
        else {
            return Ok(None);
        };
        let chunks = read_json::<Vec<GuideChunkRecord>>(&self.guide_chunks_path(fingerprint))
            .await?
            .unwrap_or_default();
        Ok(Some((record, chunks)))
    }

    async fn put_guide_ready(
        &self,
        fingerprint: &str,
        record: &CanonicalGuideRecord,
        chunks: &[GuideChunkRecord],
    ) -> anyhow::Result<()> {
        let _guard = self.txn.lock().await;
        // Chunks land before the status promotion so a ready record
        // always has its sub-records in place.
        write_json_atomic(&self.guide_chunks_path(fingerprint), &chunks.to_vec()).await?;
        write_json_atomic(&self.guide_path(fingerprint), record).await
    }

    async fn mark_guide_failed(&self, fingerprint: &str, error: &str) -> anyhow::Result<()> {
        let _guard = self.txn.lock().await;
        let path = self.guide_path(fingerprint);
        let Some(mut record) = read_json::<CanonicalGuideRecord>(&path).await? else {
            return Ok(());
        };
        record.status = GuideStatus::Failed;
        record.error = Some(error.to_owned());
        record.updated_at = Utc::now();
        write_json_atomic(&path, &record).await
    }

    async fn touch_guide_processing(&self, fingerprint: &str) -> anyhow::Result<()> {
        let _guard = self.txn.lock().await;
        let path = self.guide_path(fingerprint);
        let Some(mut record) = read_json::<CanonicalGuideRecord>(&path).await? else {
            return Ok(());
        };
        if record.status != GuideStatus::Processing {
            return Ok(());
        }
        record.updated_at = Utc::now();
        write_json_atomic(&path, &record).await
    }

    async fn init_progress(&self, scope: &str, total: usize) -> anyhow::Result<()> {
        write_json_atomic(&self.progress_path(scope), &ProgressDoc { done: 0, total }).await
    }

    async fn incr_progress(&self, scope: &str, delta: usize) -> anyhow::Result<()> {
        let _guard = self.txn.lock().await;
        let path = self.progress_path(scope);
        let Some(mut doc) = read_json::<ProgressDoc>(&path).await? else {
            return Ok(());
        };
        doc.done += delta;
        write_json_atomic(&path, &doc).await
    }

    async fn get_progress(&self, scope: &str) -> anyhow::Result<Option<(usize, usize)>> {
        Ok(read_json::<ProgressDoc>(&self.progress_path(scope))
            .await?
            .map(|doc| (doc.done, doc.total)))
    }

    async fn is_cancelled(&self, scope: &str) -> anyhow::Result<bool> {
        Ok(read_json::<ControlDoc>(&self.control_path(scope))
            .await?
            .map(|doc| doc.cancelled)
            .unwrap_or(false))
    }

    async fn set_cancelled(&self, scope: &str, cancelled: bool) -> anyhow::Result<()> {
        write_json_atomic(&self.control_path(scope), &ControlDoc { cancelled }).await
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("read: {}", path.display()));
        }
    };
    let value = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse json: {}", path.display()))?;
    Ok(Some(value))
}

async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}
