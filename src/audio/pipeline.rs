//! # Audio Pipeline
//!
//! Per-session streaming transcription: every appended fragment is written to
//! the session scratch directory, queued in a bounded FIFO, and triggers a
//! background merge+transcribe pass over a snapshot of the queue. The caller
//! gets a handle it can wait on with a bounded timeout.
//!
//! ## Concurrency contract:
//! - One pipeline per session, never shared across sessions.
//! - Appends racing an in-flight merge are allowed: each merge works on the
//!   queue snapshot taken at its trigger time, so fragments appended
//!   mid-merge are only captured by the next merge.
//! - Eviction never invalidates a snapshot already handed to a merge:
//!   fragment files are reference counted, and an evicted file is deleted
//!   only after the last merge referencing it has finished with it.
//! - A timed-out wait abandons the caller's wait only. The background task is
//!   never cancelled; it runs to completion and may overwrite the latest
//!   transcription after the caller has moved on. Within one session the
//!   result is last-writer-wins.

use crate::audio::toolchain::AudioToolchain;
use crate::audio::{purge_file, timestamp};
use crate::error::{AppError, AppResult};
use crate::transcription::TranscriptionEngine;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// A fragment file shared between the live queue and any merge snapshots
/// still holding it. The backing file is removed when the last reference
/// drops, and only if the fragment was evicted or the pipeline renewed, so a
/// merge already in flight keeps reading a complete snapshot.
struct FragmentFile {
    path: PathBuf,
    purge_on_drop: AtomicBool,
}

impl FragmentFile {
    fn new(path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            path,
            purge_on_drop: AtomicBool::new(false),
        })
    }

    /// Schedule the backing file for deletion once nothing references it.
    fn mark_purge(&self) {
        self.purge_on_drop.store(true, Ordering::Release);
    }
}

impl Drop for FragmentFile {
    fn drop(&mut self) {
        if self.purge_on_drop.load(Ordering::Acquire) {
            purge_file(&self.path);
        }
    }
}

/// Handle to one background merge+transcribe task.
///
/// Dropping the handle (or timing out the wait) detaches the task instead of
/// cancelling it; the work continues and still updates the pipeline's latest
/// transcription when it finishes.
pub struct TranscriptionHandle {
    task: JoinHandle<AppResult<String>>,
}

impl TranscriptionHandle {
    /// Wait up to `timeout` for the merge+transcribe task.
    ///
    /// On timeout the caller gets `AppError::Timeout` and the task keeps
    /// running in the background (run-to-completion policy).
    pub async fn wait(self, timeout: Duration) -> AppResult<String> {
        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(AppError::Internal(format!(
                "Transcription task failed to run: {}",
                join_error
            ))),
            Err(_) => Err(AppError::Timeout(
                "Transcription is taking longer than expected; it keeps running in the background"
                    .to_string(),
            )),
        }
    }
}

/// Streaming audio ingestion and transcription for one session.
pub struct AudioPipeline {
    session_id: String,

    /// Scratch directory owned by the session; fragment files, merge units
    /// and the concat filelist all live here
    scratch_dir: PathBuf,

    /// Bounded FIFO of live fragment files, oldest first
    fragments: Mutex<VecDeque<Arc<FragmentFile>>>,

    /// How many live fragments to keep before evicting the oldest
    capacity: usize,

    /// Latest completed transcription; overwritten, never appended
    transcription: Arc<RwLock<String>>,

    toolchain: Arc<dyn AudioToolchain>,
    transcriber: Arc<dyn TranscriptionEngine>,

    /// Per-pipeline sequence number keeping scratch file names unique even
    /// when fragments arrive within the same clock tick
    seq: AtomicU64,
}

impl AudioPipeline {
    pub fn new(
        session_id: impl Into<String>,
        scratch_dir: PathBuf,
        capacity: usize,
        toolchain: Arc<dyn AudioToolchain>,
        transcriber: Arc<dyn TranscriptionEngine>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            scratch_dir,
            fragments: Mutex::new(VecDeque::new()),
            capacity,
            transcription: Arc::new(RwLock::new(String::new())),
            toolchain,
            transcriber,
            seq: AtomicU64::new(0),
        }
    }

    /// Write one audio fragment into the scratch directory, queue it and
    /// trigger a merge+transcribe pass.
    ///
    /// Fails fast with `MissingCapability` when the audio toolchain is
    /// absent; in that case nothing beyond the original fragment file is
    /// written and the queue is left untouched.
    pub fn append_fragment(&self, bytes: &[u8]) -> AppResult<TranscriptionHandle> {
        if bytes.is_empty() {
            return Err(AppError::BadRequest("Audio fragment is empty".to_string()));
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let fragment = self.scratch_dir.join(format!("{}-{:04}.webm", timestamp(), seq));
        std::fs::write(&fragment, bytes).map_err(|e| {
            AppError::Internal(format!("Could not save fragment {}: {}", fragment.display(), e))
        })?;
        debug!("Fragment saved as {}", fragment.display());

        self.append_fragment_file(fragment)
    }

    /// Queue an already-written audio file (whole-file submissions land here
    /// after canonical-format conversion).
    pub fn append_fragment_file(&self, fragment: PathBuf) -> AppResult<TranscriptionHandle> {
        if !self.toolchain.is_available() {
            return Err(AppError::MissingCapability(
                "Audio toolchain (ffmpeg) is not installed, transcription unavailable".to_string(),
            ));
        }

        // Queue mutation and snapshot happen under one lock acquisition, so
        // the merge sees exactly the queue state at trigger time.
        let snapshot: Vec<Arc<FragmentFile>> = {
            let mut queue = self.fragments.lock().unwrap();
            queue.push_back(FragmentFile::new(fragment));

            if queue.len() > self.capacity {
                if let Some(oldest) = queue.pop_front() {
                    debug!("Fragment queue full, evicting {}", oldest.path.display());
                    // Deleted here if no merge snapshot still holds it,
                    // otherwise when the last such merge drops its snapshot.
                    oldest.mark_purge();
                }
            }

            queue.iter().cloned().collect()
        };

        Ok(self.spawn_merge(snapshot))
    }

    /// Launch the background merge+transcribe task for one queue snapshot.
    ///
    /// The task owns the snapshot's `Arc`s until the concat is done, keeping
    /// every referenced fragment file on disk even if the queue evicts it in
    /// the meantime.
    fn spawn_merge(&self, snapshot: Vec<Arc<FragmentFile>>) -> TranscriptionHandle {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let merged = self.scratch_dir.join(format!("merged-{}-{:04}.webm", timestamp(), seq));

        let toolchain = self.toolchain.clone();
        let transcriber = self.transcriber.clone();
        let transcription = self.transcription.clone();
        let session_id = self.session_id.clone();

        let task = tokio::spawn(async move {
            let paths: Vec<PathBuf> = snapshot.iter().map(|f| f.path.clone()).collect();
            let concat_result = toolchain.concat(&paths, &merged).await;
            // Evicted fragments may be deleted from here on.
            drop(snapshot);

            if let Err(e) = concat_result {
                // The unit is discarded by the toolchain; the previous
                // transcription stays intact.
                error!("Merge failed for session {}: {}", session_id, e);
                return Err(e);
            }

            match transcriber.transcribe(&merged).await {
                Ok(text) => {
                    *transcription.write().unwrap() = text.clone();
                    purge_file(&merged);
                    debug!("Transcription completed for session {}", session_id);
                    Ok(text)
                }
                Err(e) => {
                    error!("Transcription failed for session {}: {}", session_id, e);
                    purge_file(&merged);
                    Err(e)
                }
            }
        });

        TranscriptionHandle { task }
    }

    /// Latest completed transcription. Possibly stale while a merge is in
    /// flight; empty after construction or `renew`.
    pub fn latest_transcription(&self) -> String {
        self.transcription.read().unwrap().clone()
    }

    /// Number of live fragments currently queued.
    pub fn fragment_count(&self) -> usize {
        self.fragments.lock().unwrap().len()
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Reset the pipeline: drop and purge every queued fragment, clear the
    /// transcription and remove the merge scratch artifact. Idempotent and
    /// safe with no pending fragments.
    pub fn renew(&self) {
        let drained: Vec<Arc<FragmentFile>> = {
            let mut queue = self.fragments.lock().unwrap();
            queue.drain(..).collect()
        };

        let purged = drained.len();
        for fragment in drained {
            fragment.mark_purge();
        }

        self.transcription.write().unwrap().clear();
        purge_file(&self.scratch_dir.join("filelist.txt"));

        if purged > 0 {
            debug!("Renewed pipeline for session {}, purged {} fragments", self.session_id, purged);
        }
    }

    #[cfg(test)]
    pub(crate) fn queued_fragments(&self) -> Vec<PathBuf> {
        self.fragments.lock().unwrap().iter().map(|f| f.path.clone()).collect()
    }
}
