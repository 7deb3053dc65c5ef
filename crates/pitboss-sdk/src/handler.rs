//! Handler seams for function code.
//!
//! A function is either a call (`InvokeHandler`, one payload in, one out)
//! or a job (`JobHandler`, long-running, reporting progress through its
//! `JobContext`). Plain async closures work through `invoke_fn` / `job_fn`.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use pitboss_contracts::{
    error::PitbossResult,
    wire::{meta, InvokeRequest},
};

use crate::job::JobContext;

/// What a handler knows about the call it serves.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub function_id: String,
    pub idempotency_key: String,
    pub metadata: BTreeMap<String, String>,
}

impl CallContext {
    pub fn from_request(request: &InvokeRequest) -> Self {
        Self {
            function_id: request.function_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
            metadata: request.metadata.clone(),
        }
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.meta(meta::TRACE_ID)
    }

    pub fn game_id(&self) -> Option<&str> {
        self.meta(meta::GAME_ID)
    }

    pub fn env(&self) -> Option<&str> {
        self.meta(meta::ENV)
    }

    /// The admin user the call runs on behalf of.
    pub fn caller(&self) -> Option<&str> {
        self.meta(meta::CALLER)
    }
}

#[async_trait]
pub trait InvokeHandler: Send + Sync {
    async fn invoke(&self, call: CallContext, payload: Vec<u8>) -> PitbossResult<Vec<u8>>;
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run to completion. The returned bytes become the `done` frame's
    /// payload; an error becomes the terminal `error` frame.
    async fn run(&self, job: JobContext, payload: Vec<u8>) -> PitbossResult<Vec<u8>>;
}

pub struct InvokeFn<F>(F);

#[async_trait]
impl<F, Fut> InvokeHandler for InvokeFn<F>
where
    F: Fn(CallContext, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = PitbossResult<Vec<u8>>> + Send,
{
    async fn invoke(&self, call: CallContext, payload: Vec<u8>) -> PitbossResult<Vec<u8>> {
        (self.0)(call, payload).await
    }
}

pub struct JobFn<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for JobFn<F>
where
    F: Fn(JobContext, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = PitbossResult<Vec<u8>>> + Send,
{
    async fn run(&self, job: JobContext, payload: Vec<u8>) -> PitbossResult<Vec<u8>> {
        (self.0)(job, payload).await
    }
}

pub fn invoke_fn<F, Fut>(f: F) -> Arc<dyn InvokeHandler>
where
    F: Fn(CallContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PitbossResult<Vec<u8>>> + Send + 'static,
{
    Arc::new(InvokeFn(f))
}

pub fn job_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PitbossResult<Vec<u8>>> + Send + 'static,
{
    Arc::new(JobFn(f))
}
