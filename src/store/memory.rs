use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{
    AlignmentLockOutcome, AlignmentRecord, AlignmentStatus, CanonicalGuideRecord, ExplanationKey,
    ExplanationRecord, GuideBegin, GuideChunkRecord, GuideStatus, GuideStore,
};

/// In-process store. One mutex over all collections makes every trait
/// method a transaction, which is exactly what the conditional
/// lock/begin operations need.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    alignments: HashMap<String, AlignmentRecord>,
    explanations: HashMap<String, ExplanationRecord>,
    legacy_explanations: HashMap<String, ExplanationRecord>,
    guides: HashMap<String, CanonicalGuideRecord>,
    guide_chunks: HashMap<String, Vec<GuideChunkRecord>>,
    progress: HashMap<String, (usize, usize)>,
    cancelled: HashMap<String, bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl GuideStore for MemoryStore {
    async fn get_alignment(&self, key: &str) -> anyhow::Result<Option<AlignmentRecord>> {
        Ok(self.lock().alignments.get(key).cloned())
    }

    async fn try_lock_alignment(
        &self,
        key: &str,
        lock_ttl: Duration,
    ) -> anyhow::Result<AlignmentLockOutcome> {
        let now = Utc::now();
        let mut inner = self.lock();

        if let Some(existing) = inner.alignments.get(key)
            && existing.status == AlignmentStatus::Building
            && !existing.lock_expired(now)
        {
            return Ok(AlignmentLockOutcome::Busy(existing.clone()));
        }

        inner
            .alignments
            .insert(key.to_owned(), AlignmentRecord::building(now, lock_ttl));
        Ok(AlignmentLockOutcome::Acquired)
    }

    async fn put_alignment(&self, key: &str, record: &AlignmentRecord) -> anyhow::Result<()> {
        self.lock().alignments.insert(key.to_owned(), record.clone());
        Ok(())
    }

    async fn touch_alignment_checked(&self, key: &str) -> anyhow::Result<()> {
        let mut inner = self.lock();
        if let Some(record) = inner.alignments.get_mut(key) {
            record.source_checked_at = Utc::now();
        }
        Ok(())
    }

    async fn get_explanation(
        &self,
        key: &ExplanationKey,
    ) -> anyhow::Result<Option<ExplanationRecord>> {
        Ok(self.lock().explanations.get(&key.archive_path()).cloned())
    }

    async fn put_explanation(
        &self,
        key: &ExplanationKey,
        record: &ExplanationRecord,
    ) -> anyhow::Result<()> {
        self.lock()
            .explanations
            .insert(key.archive_path(), record.clone());
        Ok(())
    }

    async fn get_legacy_explanation(
        &self,
        hash_key: &str,
    ) -> anyhow::Result<Option<ExplanationRecord>> {
        Ok(self.lock().legacy_explanations.get(hash_key).cloned())
    }

    async fn put_legacy_explanation(
        &self,
        hash_key: &str,
        record: &ExplanationRecord,
    ) -> anyhow::Result<()> {
        self.lock()
            .legacy_explanations
            .insert(hash_key.to_owned(), record.clone());
        Ok(())
    }

    async fn begin_guide(
        &self,
        fingerprint: &str,
        skeleton: &CanonicalGuideRecord,
        staleness: Duration,
    ) -> anyhow::Result<GuideBegin> {
        let now = Utc::now();
        let mut inner = self.lock();

        match inner.guides.get(fingerprint) {
            Some(existing) if existing.status == GuideStatus::Ready => {
                let chunks = inner
                    .guide_chunks
                    .get(fingerprint)
                    .cloned()
                    .unwrap_or_default();
                return Ok(GuideBegin::Ready(Box::new((existing.clone(), chunks))));
            }
            Some(existing) if existing.status == GuideStatus::Processing => {
                let age = now.signed_duration_since(existing.updated_at);
                let stale = age
                    .to_std()
                    .map(|age| age >= staleness)
                    .unwrap_or(false);
                if !stale {
                    return Ok(GuideBegin::Processing);
                }
            }
            _ => {}
        }

        inner
            .guides
            .insert(fingerprint.to_owned(), skeleton.clone());
        Ok(GuideBegin::Acquired)
    }

    async fn get_guide(
        &self,
        fingerprint: &str,
    ) -> anyhow::Result<Option<(CanonicalGuideRecord, Vec<GuideChunkRecord>)>> {
        let inner = self.lock();
        Ok(inner.guides.get(fingerprint).map(|record| {
            let chunks = inner
                .guide_chunks
                .get(fingerprint)
                .cloned()
                .unwrap_or_default();
            (record.clone(), chunks)
        }))
    }

    async fn put_guide_ready(
        &self,
        fingerprint: &str,
        record: &CanonicalGuideRecord,
        chunks: &[GuideChunkRecord],
    ) -> anyhow::Result<()> {
        let mut inner = self.lock();
        inner
            .guide_chunks
            .insert(fingerprint.to_owned(), chunks.to_vec());
        inner.guides.insert(fingerprint.to_owned(), record.clone());
        Ok(())
    }

    async fn mark_guide_failed(&self, fingerprint: &str, error: &str) -> anyhow::Result<()> {
        let mut inner = self.lock();
        if let Some(record) = inner.guides.get_mut(fingerprint) {
            record.status = GuideStatus::Failed;
            record.error = Some(error.to_owned());
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn touch_guide_processing(&self, fingerprint: &str) -> anyhow::Result<()> {
        let mut inner = self.lock();
        if let Some(record) = inner.guides.get_mut(fingerprint)
            && record.status == GuideStatus::Processing
        {
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn init_progress(&self, scope: &str, total: usize) -> anyhow::Result<()> {
        self.lock().progress.insert(scope.to_owned(), (0, total));
        Ok(())
    }

    async fn incr_progress(&self, scope: &str, delta: usize) -> anyhow::Result<()> {
        let mut inner = self.lock();
        if let Some((done, _total)) = inner.progress.get_mut(scope) {
            *done += delta;
        }
        Ok(())
    }

    async fn get_progress(&self, scope: &str) -> anyhow::Result<Option<(usize, usize)>> {
        Ok(self.lock().progress.get(scope).copied())
    }

    async fn is_cancelled(&self, scope: &str) -> anyhow::Result<bool> {
        Ok(self.lock().cancelled.get(scope).copied().unwrap_or(false))
    }

    async fn set_cancelled(&self, scope: &str, cancelled: bool) -> anyhow::Result<()> {
        self.lock().cancelled.insert(scope.to_owned(), cancelled);
        Ok(())
    }
}
