// 进程内工作队列：提交与执行解耦，多个 worker 共享同一接收端。
use crate::dispatcher::Dispatcher;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSelector {
    pub site: String,
    pub account_name: String,
}

/// Everything the dispatcher needs for one attempt. Delivery is
/// at-least-once: a redelivered request is made harmless by the job state
/// machine's no-op transitions.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub job_id: String,
    pub user_id: String,
    pub site: String,
    pub action: String,
    pub account_selector: AccountSelector,
    pub payload: Value,
}

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<DispatchRequest>,
}

impl JobQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DispatchRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, request: DispatchRequest) -> Result<()> {
        info!(
            "enqueue job {} ({}.{})",
            request.job_id, request.site, request.action
        );
        self.tx
            .send(request)
            .map_err(|_| anyhow!("dispatch queue is closed"))
    }
}

pub fn spawn_dispatch_workers(
    receiver: mpsc::UnboundedReceiver<DispatchRequest>,
    dispatcher: Arc<Dispatcher>,
    workers: usize,
) {
    let receiver = Arc::new(Mutex::new(receiver));
    for index in 0..workers.max(1) {
        let receiver = receiver.clone();
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            worker_loop(index, receiver, dispatcher).await;
        });
    }
}

async fn worker_loop(
    index: usize,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<DispatchRequest>>>,
    dispatcher: Arc<Dispatcher>,
) {
    loop {
        let request = {
            let mut guard = receiver.lock().await;
            guard.recv().await
        };
        let Some(request) = request else {
            info!("dispatch worker {index} stopped: queue closed");
            return;
        };
        dispatcher.dispatch(request).await;
    }
}
