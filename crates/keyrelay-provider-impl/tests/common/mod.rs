#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use keyrelay_provider_core::{
    ExecCtx, Headers, ReverseProxyRouter, RuntimeConfig, UpstreamBody, UpstreamClient,
    UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse, UpstreamTransportErrorKind,
};

pub enum Scripted {
    Reply {
        status: u16,
        headers: Headers,
        body: &'static str,
    },
    Streamed(Vec<&'static str>),
    Transport,
}

impl Scripted {
    pub fn ok(body: &'static str) -> Self {
        Scripted::Reply {
            status: 200,
            headers: Headers::new(),
            body,
        }
    }

    pub fn status(status: u16, body: &'static str) -> Self {
        Scripted::Reply {
            status,
            headers: Headers::new(),
            body,
        }
    }
}

/// Replays canned responses in order and records every request it saw.
#[derive(Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<Scripted>>,
    seen: Mutex<Vec<UpstreamHttpRequest>>,
}

impl ScriptedClient {
    pub fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn seen(&self) -> Vec<UpstreamHttpRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.seen().into_iter().map(|req| req.url).collect()
    }
}

impl UpstreamClient for ScriptedClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        self.seen.lock().unwrap().push(req);
        let next = self.script.lock().unwrap().pop_front();
        Box::pin(async move {
            match next {
                Some(Scripted::Reply {
                    status,
                    headers,
                    body,
                }) => Ok(UpstreamHttpResponse {
                    status,
                    headers,
                    body: UpstreamBody::Bytes(Bytes::from_static(body.as_bytes())),
                }),
                Some(Scripted::Streamed(chunks)) => {
                    let (tx, rx) = tokio::sync::mpsc::channel(chunks.len().max(1));
                    for chunk in chunks {
                        tx.send(Bytes::from_static(chunk.as_bytes())).await.unwrap();
                    }
                    Ok(UpstreamHttpResponse {
                        status: 200,
                        headers: Headers::new(),
                        body: UpstreamBody::Stream(rx),
                    })
                }
                Some(Scripted::Transport) | None => Err(UpstreamFailure::Transport {
                    kind: UpstreamTransportErrorKind::Connect,
                    message: "connection refused".to_string(),
                }),
            }
        })
    }
}

pub fn ctx(config: RuntimeConfig, client: Arc<ScriptedClient>) -> (ExecCtx, Arc<ReverseProxyRouter>) {
    let router = Arc::new(ReverseProxyRouter::new());
    let ctx = ExecCtx::new("trace-test", Arc::new(config), router.clone(), client);
    (ctx, router)
}

pub const COMPLETED_SSE: &str = "event: response.created\n\
data: {\"type\":\"response.created\"}\n\n\
event: response.completed\n\
data: {\"type\":\"response.completed\",\"response\":{\"id\":\"resp_1\",\"status\":\"completed\"}}\n\n";
