//! The agent's function server: picks a local instance and forwards.
//!
//! Selection is first-registered unless the call names a
//! `target_service_id`. With no instance to call the answer is an explicit
//! `no_provider`, never an empty payload. The per-call timeout is the
//! `timeout_ms` the Server put in the metadata, else the agent default.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tracing::{debug, info, warn};

use pitboss_contracts::{
    error::{PitbossError, PitbossResult},
    session::LocalInstance,
    wire::{meta, CancelJobRequest, CancelJobResponse, FrameKind, InvokeRequest, InvokeResponse, StartJobResponse},
};
use pitboss_core::{relay_frames, traits::JobFrames};
use pitboss_rpc::RpcClient;

use crate::job_index::JobIndex;
use crate::local_store::LocalStore;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Forwarder {
    store: Arc<LocalStore>,
    jobs: Arc<JobIndex>,
    client: RpcClient,
    default_timeout: Duration,
}

impl Forwarder {
    pub fn new(store: Arc<LocalStore>, jobs: Arc<JobIndex>, client: RpcClient, default_timeout: Duration) -> Self {
        Self { store, jobs, client, default_timeout }
    }

    pub fn jobs(&self) -> &Arc<JobIndex> {
        &self.jobs
    }

    fn select(&self, request: &InvokeRequest) -> PitbossResult<LocalInstance> {
        let target = request.meta(meta::TARGET_SERVICE_ID);
        self.store.pick(&request.function_id, target).ok_or_else(|| {
            debug!(function_id = %request.function_id, target = ?target, "no local instance");
            PitbossError::NoProvider { function_id: request.function_id.clone() }
        })
    }

    fn timeout_for(&self, request: &InvokeRequest) -> Duration {
        request
            .meta(meta::TIMEOUT_MS)
            .and_then(|ms| ms.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout)
    }

    pub async fn invoke(&self, request: InvokeRequest) -> PitbossResult<InvokeResponse> {
        let instance = self.select(&request)?;
        let timeout = self.timeout_for(&request);
        debug!(
            function_id = %request.function_id,
            service_id = %instance.service_id,
            trace_id = request.meta(meta::TRACE_ID).unwrap_or_default(),
            "forwarding invoke"
        );
        self.client
            .invoke(&instance.addr, &request, timeout)
            .await
            .map_err(|e| e.into_inner().with_context(format!("instance '{}'", instance.service_id)))
    }

    pub async fn start_job(&self, request: InvokeRequest) -> PitbossResult<StartJobResponse> {
        let instance = self.select(&request)?;
        let timeout = self.timeout_for(&request);
        let response = self
            .client
            .start_job(&instance.addr, &request, timeout)
            .await
            .map_err(|e| e.into_inner().with_context(format!("instance '{}'", instance.service_id)))?;

        if self.jobs.record(&response.job_id, &instance.addr) {
            info!(job_id = %response.job_id, service_id = %instance.service_id, "job started");
        }
        Ok(response)
    }

    /// Frames from the instance holding `job_id`, ending in exactly one
    /// terminal frame. A `done` or `error` frame unmaps the job; a broken
    /// stream leaves it mapped, since the job may still be running.
    pub async fn stream_job(&self, job_id: &str) -> PitbossResult<JobFrames> {
        let addr = self
            .jobs
            .get(job_id)
            .ok_or_else(|| PitbossError::not_found(format!("job '{job_id}'")))?;
        let upstream = self.client.stream_job(&addr, job_id).await.map_err(|e| e.into_inner())?;

        let jobs = Arc::clone(&self.jobs);
        let job_id = job_id.to_string();
        let frames = relay_frames(upstream, format!("instance at {addr}")).inspect(move |frame| {
            if matches!(frame.kind, FrameKind::Done | FrameKind::Error) && jobs.remove(&job_id).is_some() {
                debug!(job_id = %job_id, "job finished; mapping dropped");
            }
        });
        Ok(Box::pin(frames))
    }

    /// Best effort: an unknown job, or an instance that cannot be reached,
    /// is still acknowledged with the job id.
    pub async fn cancel_job(&self, request: CancelJobRequest) -> PitbossResult<CancelJobResponse> {
        if request.job_id.is_empty() {
            return Err(PitbossError::invalid("job_id", "must not be empty"));
        }
        let Some(addr) = self.jobs.get(&request.job_id) else {
            debug!(job_id = %request.job_id, "cancel for unmapped job acknowledged");
            return Ok(CancelJobResponse { job_id: request.job_id });
        };

        match self.client.cancel_job(&addr, &request, self.default_timeout).await {
            Ok(response) => {
                self.jobs.remove(&request.job_id);
                info!(job_id = %request.job_id, addr = %addr, "job cancelled");
                Ok(response)
            }
            Err(e) => {
                warn!(job_id = %request.job_id, addr = %addr, error = ?e, "cancel not delivered; acknowledging anyway");
                Ok(CancelJobResponse { job_id: request.job_id })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{extract::State, routing::post, Json, Router};
    use futures_util::StreamExt;
    use tokio::net::TcpListener;

    use pitboss_contracts::{error::ErrorKind, wire::JobFrame};
    use pitboss_rpc::{ndjson_response, paths, ApiResult};

    use super::*;

    #[derive(Clone, Default)]
    struct Instance {
        cancels: Arc<AtomicUsize>,
    }

    async fn spawn_instance(tag: &'static str) -> (String, Instance) {
        let instance = Instance::default();
        let app = Router::new()
            .route(
                paths::RPC_INVOKE,
                post(move |Json(req): Json<InvokeRequest>| async move {
                    let mut payload = tag.as_bytes().to_vec();
                    payload.extend_from_slice(&req.payload);
                    Json(InvokeResponse { payload })
                }),
            )
            .route(
                paths::RPC_START_JOB,
                post(|| async { Json(StartJobResponse { job_id: "j42".to_string() }) }),
            )
            .route(
                paths::RPC_STREAM_JOB,
                post(|| async {
                    let frames = futures_util::stream::iter(vec![JobFrame::log("working")]);
                    ndjson_response(Box::pin(frames))
                }),
            )
            .route(
                paths::RPC_CANCEL_JOB,
                post(|State(i): State<Instance>, Json(req): Json<CancelJobRequest>| async move {
                    i.cancels.fetch_add(1, Ordering::SeqCst);
                    let result: ApiResult<CancelJobResponse> = Ok(Json(CancelJobResponse { job_id: req.job_id }));
                    result
                }),
            )
            .with_state(instance.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, instance)
    }

    fn forwarder(store: Arc<LocalStore>) -> Forwarder {
        Forwarder::new(
            store,
            Arc::new(JobIndex::new()),
            RpcClient::new(Duration::from_secs(1)).unwrap(),
            DEFAULT_CALL_TIMEOUT,
        )
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn invoke_goes_to_the_first_instance_or_the_target() {
        let (addr_a, _) = spawn_instance("a:").await;
        let (addr_b, _) = spawn_instance("b:").await;
        let store = Arc::new(LocalStore::new());
        store.register("svc-a", &addr_a, "", &ids(&["player.ban"]));
        store.register("svc-b", &addr_b, "", &ids(&["player.ban"]));
        let fwd = forwarder(store);

        let resp = fwd.invoke(InvokeRequest::new("player.ban", b"x".to_vec())).await.unwrap();
        assert_eq!(resp.payload, b"a:x".to_vec());

        let mut req = InvokeRequest::new("player.ban", b"y".to_vec());
        req.metadata.insert(meta::TARGET_SERVICE_ID.to_string(), "svc-b".to_string());
        assert_eq!(fwd.invoke(req).await.unwrap().payload, b"b:y".to_vec());
    }

    #[tokio::test]
    async fn missing_instance_is_an_explicit_no_provider() {
        let fwd = forwarder(Arc::new(LocalStore::new()));
        match fwd.invoke(InvokeRequest::new("player.ban", Vec::new())).await {
            Err(PitbossError::NoProvider { function_id }) => assert_eq!(function_id, "player.ban"),
            other => panic!("expected no_provider, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unreachable_instance_is_upstream_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap().to_string();
        drop(listener);

        let store = Arc::new(LocalStore::new());
        store.register("svc-a", &dead, "", &ids(&["player.ban"]));
        let err = forwarder(store).invoke(InvokeRequest::new("player.ban", Vec::new())).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
        assert!(err.message().contains("svc-a"));
    }

    #[test]
    fn metadata_timeout_overrides_the_default() {
        let fwd = forwarder(Arc::new(LocalStore::new()));
        let mut req = InvokeRequest::new("reports.export", Vec::new());
        assert_eq!(fwd.timeout_for(&req), DEFAULT_CALL_TIMEOUT);
        req.metadata.insert(meta::TIMEOUT_MS.to_string(), "250".to_string());
        assert_eq!(fwd.timeout_for(&req), Duration::from_millis(250));
        req.metadata.insert(meta::TIMEOUT_MS.to_string(), "soon".to_string());
        assert_eq!(fwd.timeout_for(&req), DEFAULT_CALL_TIMEOUT);
    }

    #[tokio::test]
    async fn job_lifecycle_maps_streams_and_unmaps_on_cancel() {
        let (addr, instance) = spawn_instance("").await;
        let store = Arc::new(LocalStore::new());
        store.register("svc-a", &addr, "", &ids(&["reports.export"]));
        let fwd = forwarder(store);

        let started = fwd.start_job(InvokeRequest::new("reports.export", Vec::new())).await.unwrap();
        assert_eq!(started.job_id, "j42");
        assert_eq!(fwd.jobs().get("j42").as_deref(), Some(addr.as_str()));

        let frames: Vec<JobFrame> = fwd.stream_job("j42").await.unwrap().collect().await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].kind, FrameKind::UpstreamClosed);
        assert!(fwd.jobs().get("j42").is_some());

        let cancel = CancelJobRequest { job_id: "j42".to_string(), reason: String::new() };
        assert_eq!(fwd.cancel_job(cancel).await.unwrap().job_id, "j42");
        assert_eq!(instance.cancels.load(Ordering::SeqCst), 1);
        assert!(fwd.jobs().get("j42").is_none());
    }

    #[tokio::test]
    async fn finished_job_is_unmapped_by_its_stream() {
        let app = Router::new()
            .route(
                paths::RPC_START_JOB,
                post(|| async { Json(StartJobResponse { job_id: "j9".to_string() }) }),
            )
            .route(
                paths::RPC_STREAM_JOB,
                post(|| async {
                    let frames = futures_util::stream::iter(vec![
                        JobFrame::progress(50, "half"),
                        JobFrame::done(b"report".to_vec()),
                    ]);
                    ndjson_response(Box::pin(frames))
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let store = Arc::new(LocalStore::new());
        store.register("svc-a", &addr, "", &ids(&["reports.export"]));
        let fwd = forwarder(store);
        fwd.start_job(InvokeRequest::new("reports.export", Vec::new())).await.unwrap();
        assert_eq!(fwd.jobs().len(), 1);

        let frames: Vec<JobFrame> = fwd.stream_job("j9").await.unwrap().collect().await;
        assert_eq!(frames.last().unwrap().kind, FrameKind::Done);
        assert!(fwd.jobs().is_empty());
    }

    #[tokio::test]
    async fn cancel_of_unknown_job_is_acknowledged() {
        let fwd = forwarder(Arc::new(LocalStore::new()));
        let cancel = CancelJobRequest { job_id: "j42".to_string(), reason: "restart".to_string() };
        assert_eq!(fwd.cancel_job(cancel).await.unwrap().job_id, "j42");

        match fwd.stream_job("j42").await {
            Err(PitbossError::NotFound { .. }) => {}
            Err(other) => panic!("expected not_found, got {:?}", other),
            Ok(_) => panic!("expected not_found, got a stream"),
        }
    }

    #[tokio::test]
    async fn failed_cancel_keeps_the_mapping() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap().to_string();
        drop(listener);

        let fwd = forwarder(Arc::new(LocalStore::new()));
        fwd.jobs().record("j7", &dead);
        let cancel = CancelJobRequest { job_id: "j7".to_string(), reason: String::new() };
        assert_eq!(fwd.cancel_job(cancel).await.unwrap().job_id, "j7");
        assert!(fwd.jobs().get("j7").is_some());
    }
}
