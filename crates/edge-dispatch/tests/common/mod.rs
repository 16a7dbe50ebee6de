#![allow(dead_code)]

use async_trait::async_trait;
use edge_database::AsyncDatabase;
use edge_dispatch::{
    DispatchError, DispatchResult, DispatcherOptions, EdgeDispatcher, EdgeRequest, HttpResponse,
    HttpTransport,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// One scripted reply.
pub enum Reply {
    Respond(HttpResponse),
    NetworkError(&'static str),
    /// Never answers; models a process dying mid-request.
    Hang,
}

pub fn ok(body: Value) -> Reply {
    Reply::Respond(HttpResponse {
        status: 200,
        retry_after: None,
        body: body.to_string(),
    })
}

pub fn status(code: u16, retry_after: Option<&str>) -> Reply {
    Reply::Respond(HttpResponse {
        status: code,
        retry_after: retry_after.map(str::to_string),
        body: String::new(),
    })
}

/// Transport that replays a script and records every request it sees.
///
/// Once the script runs out it answers `200` with an empty body.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Reply>>,
    seen: Mutex<Vec<(Instant, EdgeRequest)>>,
    arrived: Notify,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        })
    }

    pub fn requests(&self) -> Vec<EdgeRequest> {
        self.seen.lock().iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn timestamps(&self) -> Vec<Instant> {
        self.seen.lock().iter().map(|(at, _)| *at).collect()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().len()
    }

    /// Wait until at least `n` requests arrived.
    pub async fn wait_for(&self, n: usize) {
        loop {
            let notified = self.arrived.notified();
            if self.count() >= n {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn post(&self, request: &EdgeRequest) -> DispatchResult<HttpResponse> {
        self.seen.lock().push((Instant::now(), request.clone()));
        self.arrived.notify_waiters();

        let reply = self.script.lock().pop_front();
        match reply {
            Some(Reply::Respond(response)) => Ok(response),
            Some(Reply::NetworkError(reason)) => {
                Err(DispatchError::TransientNetwork(reason.to_string()))
            }
            Some(Reply::Hang) => std::future::pending().await,
            None => Ok(HttpResponse {
                status: 200,
                retry_after: None,
                body: String::new(),
            }),
        }
    }
}

pub fn configuration() -> Value {
    json!({ "edge.configId": "cfg-1234", "experienceCloud.org": "ORG@AdobeOrg" })
}

pub fn consent(val: &str) -> Value {
    json!({ "consents": { "collect": { "val": val } } })
}

pub async fn open(db: AsyncDatabase, transport: Arc<ScriptedTransport>) -> EdgeDispatcher {
    EdgeDispatcher::open(db, DispatcherOptions::default(), transport)
        .await
        .expect("failed to open dispatcher")
}

/// Dispatcher over an in-memory database, already configured.
pub async fn configured(transport: Arc<ScriptedTransport>) -> (EdgeDispatcher, AsyncDatabase) {
    let db = AsyncDatabase::open_in_memory()
        .await
        .expect("failed to open database");
    let dispatcher = open(db.clone(), transport).await;
    dispatcher
        .update_configuration(&configuration())
        .await
        .expect("failed to apply configuration");
    (dispatcher, db)
}

/// Poll until the hit queue is empty.
pub async fn drained(dispatcher: &EdgeDispatcher) {
    for _ in 0..500 {
        if dispatcher.queue_status().await.expect("queue status").queued == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("hit queue never drained");
}

pub fn event_type(request: &EdgeRequest) -> String {
    request.body["events"][0]["xdm"]["eventType"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}
