//! Scriptable in-process client for tests and local runs.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use sifen_core::models::{RemoteOutcome, TrackingInfo};

use crate::{ClientCredential, RemoteReply, SifenClient, TransportError};

type ScriptedReply = Result<RemoteReply, TransportError>;

#[derive(Default)]
struct Script {
    submit: VecDeque<ScriptedReply>,
    query: VecDeque<ScriptedReply>,
    event: VecDeque<ScriptedReply>,
}

/// Replays scripted replies in order; when a script runs dry the mock falls
/// back to an accepted-batch reply so simple smoke runs keep working.
#[derive(Default)]
pub struct MockClient {
    script: Mutex<Script>,
    calls: Mutex<Vec<&'static str>>,
}

impl MockClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_submit(&self, reply: ScriptedReply) {
        self.script.lock().unwrap().submit.push_back(reply);
    }

    pub fn push_query(&self, reply: ScriptedReply) {
        self.script.lock().unwrap().query.push_back(reply);
    }

    pub fn push_event(&self, reply: ScriptedReply) {
        self.script.lock().unwrap().event.push_back(reply);
    }

    /// Endpoint names invoked, in call order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn default_receipt() -> RemoteReply {
        RemoteReply {
            outcome: RemoteOutcome::Approved(TrackingInfo {
                code: "0300".to_string(),
                protocol: Some("mock-protocol".to_string()),
                message: "Lote recibido".to_string(),
            }),
            raw: "<mock/>".to_string(),
        }
    }
}

pub fn reply(outcome: RemoteOutcome) -> ScriptedReply {
    Ok(RemoteReply { outcome, raw: "<mock/>".to_string() })
}

#[async_trait]
impl SifenClient for MockClient {
    async fn submit_batch(
        &self,
        _payload_b64: &str,
        _credential: &ClientCredential,
    ) -> Result<RemoteReply, TransportError> {
        self.calls.lock().unwrap().push("recebe-lote");
        let scripted = self.script.lock().unwrap().submit.pop_front();
        scripted.unwrap_or_else(|| Ok(Self::default_receipt()))
    }

    async fn query_batch(
        &self,
        _protocol: &str,
        _credential: &ClientCredential,
    ) -> Result<RemoteReply, TransportError> {
        self.calls.lock().unwrap().push("consulta-lote");
        let scripted = self.script.lock().unwrap().query.pop_front();
        scripted.unwrap_or_else(|| reply(RemoteOutcome::StillProcessing))
    }

    async fn submit_event(
        &self,
        _event_xml: &str,
        _credential: &ClientCredential,
    ) -> Result<RemoteReply, TransportError> {
        self.calls.lock().unwrap().push("evento");
        let scripted = self.script.lock().unwrap().event.pop_front();
        scripted.unwrap_or_else(|| {
            reply(RemoteOutcome::CancellationApproved {
                code: "0500".to_string(),
                message: "Evento registrado".to_string(),
                protocol: Some("mock-event".to_string()),
            })
        })
    }
}
