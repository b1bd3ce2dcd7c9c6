#![allow(dead_code)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{HeaderMap, Request, StatusCode},
};
use overpush_gateway::{
    api,
    clients::queue::TaskQueue,
    config::ServerConfig,
    error::QueueError,
    models::{
        message::MessageTask,
        response::Envelope,
        task::{Task, TaskInfo},
    },
};
use tower::ServiceExt;

/// In-memory queue that records every submission.
#[derive(Default)]
pub struct RecordingQueue {
    tasks: Mutex<Vec<Task>>,
    closed: AtomicBool,
    closed_mid_enqueue: AtomicBool,
    in_flight: AtomicUsize,
    fail: bool,
    delay: Option<Duration>,
}

impl RecordingQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Default::default()
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Default::default()
        })
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<MessageTask> {
        self.tasks()
            .iter()
            .map(|t| MessageTask::decode(&t.payload).unwrap())
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn closed_mid_enqueue(&self) -> bool {
        self.closed_mid_enqueue.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue(&self, task: Task) -> Result<TaskInfo, QueueError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.is_closed() {
            self.closed_mid_enqueue.store(true, Ordering::SeqCst);
            return Err(QueueError::Closed);
        }

        if self.fail {
            return Err(QueueError::Enqueue(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))));
        }

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(task.clone());

        Ok(TaskInfo {
            id: format!("task-{}", tasks.len()),
            queue: "default".to_string(),
            kind: task.kind,
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub fn app(queue: Arc<RecordingQueue>) -> Router {
    api::router(queue, ServerConfig::default())
}

pub fn json_post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn send(router: &Router, request: Request<Body>) -> Result<(StatusCode, HeaderMap, Envelope)> {
    let response = router.clone().oneshot(request).await?;
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    let envelope = serde_json::from_slice(&bytes)?;

    Ok((status, headers, envelope))
}
