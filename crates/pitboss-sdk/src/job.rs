//! The job runtime.
//!
//! Each job runs on its own task and appends frames to a per-job log. A
//! stream replays the log from the start and then follows it, so a caller
//! that subscribes late still sees every frame, and every stream ends with
//! exactly one terminal frame. Cancellation drops the handler future and
//! records a `cancelled` error frame.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pitboss_contracts::{
    error::{PitbossError, PitbossResult},
    wire::JobFrame,
};
use pitboss_core::traits::JobFrames;

use crate::handler::{CallContext, JobHandler};

struct JobLog {
    frames: Vec<JobFrame>,
    finished_at: Option<Instant>,
}

struct JobEntry {
    function_id: String,
    token: CancellationToken,
    log: Mutex<JobLog>,
    /// Frame count, bumped on every append.
    appended: watch::Sender<usize>,
}

impl JobEntry {
    fn new(function_id: String) -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            function_id,
            token: CancellationToken::new(),
            log: Mutex::new(JobLog { frames: Vec::new(), finished_at: None }),
            appended,
        }
    }

    /// Append unless a terminal frame is already recorded.
    fn push(&self, frame: JobFrame) -> bool {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        if log.finished_at.is_some() {
            return false;
        }
        if frame.is_terminal() {
            log.finished_at = Some(Instant::now());
        }
        log.frames.push(frame);
        let len = log.frames.len();
        drop(log);
        self.appended.send_replace(len);
        true
    }

    /// Frames from `from` onwards, and whether the log is finished.
    fn read_from(&self, from: usize) -> (Vec<JobFrame>, bool) {
        let log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        let frames = log.frames.get(from..).map(<[JobFrame]>::to_vec).unwrap_or_default();
        (frames, log.finished_at.is_some())
    }

    fn finished_before(&self, cutoff: Instant) -> bool {
        let log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(log.finished_at, Some(at) if at < cutoff)
    }
}

/// Handed to a `JobHandler`: identity, call metadata, progress reporting
/// and cancellation.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    pub call: CallContext,
    entry: Arc<JobEntry>,
}

impl JobContext {
    pub fn progress(&self, percent: u8, message: impl Into<String>) {
        self.entry.push(JobFrame::progress(percent, message));
    }

    pub fn log(&self, message: impl Into<String>) {
        self.entry.push(JobFrame::log(message));
    }

    pub fn is_cancelled(&self) -> bool {
        self.entry.token.is_cancelled()
    }

    /// Resolves once the job is cancelled.
    pub async fn cancelled(&self) {
        self.entry.token.cancelled().await
    }
}

pub struct JobRuntime {
    jobs: Mutex<HashMap<String, Arc<JobEntry>>>,
    retention: Duration,
}

impl JobRuntime {
    pub fn new(retention: Duration) -> Self {
        Self { jobs: Mutex::new(HashMap::new()), retention }
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<JobEntry>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start `handler` on its own task and return the new job id.
    pub fn start(&self, handler: Arc<dyn JobHandler>, call: CallContext, payload: Vec<u8>) -> String {
        self.prune();
        let job_id = uuid::Uuid::new_v4().simple().to_string();
        let entry = Arc::new(JobEntry::new(call.function_id.clone()));
        self.jobs().insert(job_id.clone(), Arc::clone(&entry));

        let ctx = JobContext { job_id: job_id.clone(), call, entry: Arc::clone(&entry) };
        info!(job_id = %job_id, function_id = %entry.function_id, "job started");
        tokio::spawn(async move {
            let job_id = ctx.job_id.clone();
            let token = entry.token.clone();
            let mut work = tokio::spawn(async move { handler.run(ctx, payload).await });
            let outcome = tokio::select! {
                joined = &mut work => match joined {
                    Ok(result) => result,
                    Err(e) => Err(PitbossError::internal(format!("job task failed: {e}"))),
                },
                _ = token.cancelled() => {
                    work.abort();
                    Err(PitbossError::Cancelled { reason: "job cancelled".to_string() })
                }
            };
            let frame = match &outcome {
                Ok(payload) => JobFrame::done(payload.clone()),
                Err(e) => JobFrame::error(e),
            };
            match &outcome {
                Ok(_) => info!(job_id = %job_id, "job finished"),
                Err(e) => warn!(job_id = %job_id, code = e.code(), error = %e, "job failed"),
            }
            entry.push(frame);
        });
        job_id
    }

    /// Every frame of the job, replayed then followed to the terminal one.
    pub fn frames(&self, job_id: &str) -> PitbossResult<JobFrames> {
        let entry = self
            .jobs()
            .get(job_id)
            .cloned()
            .ok_or_else(|| PitbossError::not_found(format!("job '{job_id}'")))?;
        let mut appended = entry.appended.subscribe();
        let frames = async_stream::stream! {
            let mut seen = 0;
            loop {
                appended.borrow_and_update();
                let (batch, finished) = entry.read_from(seen);
                seen += batch.len();
                for frame in batch {
                    yield frame;
                }
                if finished {
                    return;
                }
                if appended.changed().await.is_err() {
                    yield JobFrame::upstream_closed("job log closed");
                    return;
                }
            }
        };
        Ok(Box::pin(frames))
    }

    /// Best effort: the job stops at its next await point.
    pub fn cancel(&self, job_id: &str, reason: &str) -> PitbossResult<()> {
        let entry = self
            .jobs()
            .get(job_id)
            .cloned()
            .ok_or_else(|| PitbossError::not_found(format!("job '{job_id}'")))?;
        info!(job_id, function_id = %entry.function_id, reason, "job cancel requested");
        entry.token.cancel();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget jobs that finished longer than the retention period ago.
    pub fn prune(&self) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(self.retention) else {
            return 0;
        };
        let mut jobs = self.jobs();
        let before = jobs.len();
        jobs.retain(|_, entry| !entry.finished_before(cutoff));
        let removed = before - jobs.len();
        if removed > 0 {
            debug!(removed, "finished jobs pruned");
        }
        removed
    }

    /// Cancel every running job; used on shutdown.
    pub fn cancel_all(&self) {
        for entry in self.jobs().values() {
            entry.token.cancel();
        }
    }
}

impl Default for JobRuntime {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use pitboss_contracts::{error::ErrorKind, wire::FrameKind};

    use super::*;
    use crate::handler::job_fn;

    fn call_context(function_id: &str) -> CallContext {
        CallContext { function_id: function_id.to_string(), ..CallContext::default() }
    }

    fn counting_job() -> Arc<dyn JobHandler> {
        job_fn(|job: JobContext, payload: Vec<u8>| async move {
            for step in 1..=3u8 {
                job.progress(step * 25, format!("step {step}"));
                tokio::task::yield_now().await;
            }
            Ok(payload)
        })
    }

    #[tokio::test]
    async fn late_subscriber_sees_every_frame() {
        let runtime = JobRuntime::default();
        let job_id = runtime.start(counting_job(), call_context("reports.export"), b"report".to_vec());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let frames: Vec<JobFrame> = runtime.frames(&job_id).unwrap().collect().await;
        let kinds: Vec<FrameKind> = frames.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![FrameKind::Progress, FrameKind::Progress, FrameKind::Progress, FrameKind::Done]);
        assert_eq!(frames[3].payload, b"report".to_vec());
    }

    #[tokio::test]
    async fn cancel_ends_the_stream_with_one_error_frame() {
        let runtime = JobRuntime::default();
        let handler = job_fn(|job: JobContext, _payload: Vec<u8>| async move {
            job.log("waiting");
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        });
        let job_id = runtime.start(handler, call_context("reports.export"), Vec::new());
        let stream = runtime.frames(&job_id).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        runtime.cancel(&job_id, "operator").unwrap();

        let frames: Vec<JobFrame> = tokio::time::timeout(Duration::from_secs(2), stream.collect())
            .await
            .unwrap();
        let last = frames.last().unwrap();
        assert_eq!(last.kind, FrameKind::Error);
        assert_eq!(last.code.as_deref(), Some("cancelled"));
        assert_eq!(frames.iter().filter(|f| f.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn handler_error_becomes_the_terminal_frame() {
        let runtime = JobRuntime::default();
        let handler = job_fn(|_job: JobContext, _payload: Vec<u8>| async move {
            Err(PitbossError::invalid("range", "end before start"))
        });
        let job_id = runtime.start(handler, call_context("reports.export"), Vec::new());
        let frames: Vec<JobFrame> = runtime.frames(&job_id).unwrap().collect().await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].code.as_deref(), Some("invalid_argument"));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let runtime = JobRuntime::default();
        match runtime.frames("nope") {
            Err(e) => assert_eq!(e.kind(), ErrorKind::NotFound),
            Ok(_) => panic!("expected not_found"),
        }
        assert_eq!(runtime.cancel("nope", "").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn finished_jobs_are_pruned_after_retention() {
        let runtime = JobRuntime::new(Duration::from_millis(10));
        let job_id = runtime.start(counting_job(), call_context("reports.export"), Vec::new());
        let _: Vec<JobFrame> = runtime.frames(&job_id).unwrap().collect().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(runtime.prune(), 1);
        assert!(runtime.is_empty());
    }
}
