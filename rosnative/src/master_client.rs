//! The XML-RPC client side: a retry queue for calls to the master, plus
//! one-shot calls to peer node slave APIs.
//!
//! Master calls are strictly FIFO with at most one outstanding request.
//! When the master is unreachable the head call is retried on a backoff
//! schedule instead of failing, so registration issued before the master
//! is up completes once it arrives.

use abort_on_drop::ChildTask;
use log::*;
use rosnative_common::{Error, Result};
use serde::de::DeserializeOwned;
use serde_xmlrpc::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Delay schedule between retries of an unreachable master, in ms.
/// Saturates at the last entry; resets after a successful call.
const BACKOFF_MS: [u64; 18] = [
    1, 2, 2, 4, 4, 4, 4, 8, 8, 8, 8, 16, 32, 64, 128, 256, 512, 1000,
];

/// Delay applied before the retry that follows the k-th consecutive failure.
pub(crate) fn backoff_delay(consecutive_failures: usize) -> Duration {
    let idx = consecutive_failures
        .saturating_sub(1)
        .min(BACKOFF_MS.len() - 1);
    Duration::from_millis(BACKOFF_MS[idx])
}

struct MasterRequest {
    method: &'static str,
    params: Vec<Value>,
    reply: oneshot::Sender<Result<Value>>,
}

/// Handle to the master call queue. Cheap to clone; the queue task exits
/// when the last handle is dropped.
#[derive(Clone)]
pub(crate) struct MasterClient {
    caller_id: String,
    caller_api: String,
    queue: mpsc::UnboundedSender<MasterRequest>,
    _queue_task: Arc<ChildTask<()>>,
}

impl MasterClient {
    /// * `caller_id` - the global name of this node
    /// * `caller_api` - the node's slave XML-RPC URI, reported to the master
    pub(crate) fn new(master_uri: String, caller_id: String, caller_api: String) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let queue_task = tokio::spawn(queue_task(master_uri, rx));
        Self {
            caller_id,
            caller_api,
            queue,
            _queue_task: Arc::new(queue_task.into()),
        }
    }

    async fn call(&self, method: &'static str, params: Vec<Value>) -> Result<Value> {
        let (reply, response) = oneshot::channel();
        self.queue
            .send(MasterRequest {
                method,
                params,
                reply,
            })
            .map_err(|_| Error::ShuttingDown)?;
        response.await.map_err(|_| Error::ShuttingDown)?
    }

    fn value(input: impl serde::Serialize) -> Result<Value> {
        serde_xmlrpc::to_value(input).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
        serde_xmlrpc::from_value(value).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Registers a publisher; returns the topic's current subscriber APIs.
    pub(crate) async fn register_publisher(
        &self,
        topic: &str,
        topic_type: &str,
    ) -> Result<Vec<String>> {
        let value = self
            .call(
                "registerPublisher",
                vec![
                    Self::value(&self.caller_id)?,
                    Self::value(topic)?,
                    Self::value(topic_type)?,
                    Self::value(&self.caller_api)?,
                ],
            )
            .await?;
        Self::decode(value)
    }

    pub(crate) async fn unregister_publisher(&self, topic: &str) -> Result<()> {
        self.call(
            "unregisterPublisher",
            vec![
                Self::value(&self.caller_id)?,
                Self::value(topic)?,
                Self::value(&self.caller_api)?,
            ],
        )
        .await?;
        Ok(())
    }

    /// Registers a subscriber; returns the topic's current publisher APIs.
    pub(crate) async fn register_subscriber(
        &self,
        topic: &str,
        topic_type: &str,
    ) -> Result<Vec<String>> {
        let value = self
            .call(
                "registerSubscriber",
                vec![
                    Self::value(&self.caller_id)?,
                    Self::value(topic)?,
                    Self::value(topic_type)?,
                    Self::value(&self.caller_api)?,
                ],
            )
            .await?;
        Self::decode(value)
    }

    pub(crate) async fn unregister_subscriber(&self, topic: &str) -> Result<()> {
        self.call(
            "unregisterSubscriber",
            vec![
                Self::value(&self.caller_id)?,
                Self::value(topic)?,
                Self::value(&self.caller_api)?,
            ],
        )
        .await?;
        Ok(())
    }

    /// * `service_api` - the `rosrpc://host:port` URI of the service endpoint
    pub(crate) async fn register_service(&self, service: &str, service_api: &str) -> Result<()> {
        self.call(
            "registerService",
            vec![
                Self::value(&self.caller_id)?,
                Self::value(service)?,
                Self::value(service_api)?,
                Self::value(&self.caller_api)?,
            ],
        )
        .await?;
        Ok(())
    }

    pub(crate) async fn unregister_service(&self, service: &str, service_api: &str) -> Result<()> {
        self.call(
            "unregisterService",
            vec![
                Self::value(&self.caller_id)?,
                Self::value(service)?,
                Self::value(service_api)?,
            ],
        )
        .await?;
        Ok(())
    }

    /// Resolves a service name to its `rosrpc://host:port` URI.
    pub(crate) async fn lookup_service(&self, service: &str) -> Result<String> {
        let value = self
            .call(
                "lookupService",
                vec![Self::value(&self.caller_id)?, Self::value(service)?],
            )
            .await?;
        Self::decode(value)
    }
}

enum CallFailure {
    /// The endpoint wasn't reachable at all; worth retrying.
    Unreachable(reqwest::Error),
    /// The call completed or failed in a way retrying won't fix.
    Definitive(Error),
}

async fn queue_task(master_uri: String, mut rx: mpsc::UnboundedReceiver<MasterRequest>) {
    let client = reqwest::Client::new();
    let mut consecutive_failures = 0usize;
    while let Some(request) = rx.recv().await {
        let outcome = loop {
            match execute(&client, &master_uri, request.method, &request.params).await {
                Ok(value) => {
                    consecutive_failures = 0;
                    break Ok(value);
                }
                Err(CallFailure::Definitive(err)) => break Err(err),
                Err(CallFailure::Unreachable(err)) => {
                    consecutive_failures += 1;
                    let delay = backoff_delay(consecutive_failures);
                    debug!(
                        "Master at {master_uri} unreachable ({err}), retrying {} in {delay:?}",
                        request.method
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };
        // Receiver may have given up on the call, that's fine
        let _ = request.reply.send(outcome);
    }
    debug!("Master call queue for {master_uri} closed");
}

async fn execute(
    client: &reqwest::Client,
    uri: &str,
    method: &str,
    params: &[Value],
) -> std::result::Result<Value, CallFailure> {
    let body = serde_xmlrpc::request_to_string(method, params.to_vec())
        .map_err(|e| CallFailure::Definitive(Error::Serialization(e.to_string())))?;
    let response = client.post(uri).body(body).send().await.map_err(|e| {
        if e.is_connect() || e.is_timeout() {
            CallFailure::Unreachable(e)
        } else {
            CallFailure::Definitive(Error::Unexpected(anyhow::Error::new(e)))
        }
    })?;
    let text = response
        .text()
        .await
        .map_err(|e| CallFailure::Definitive(Error::Unexpected(anyhow::Error::new(e))))?;
    let (code, status_message, value): (i32, String, Value) =
        serde_xmlrpc::response_from_str(&text)
            .map_err(|e| CallFailure::Definitive(Error::Serialization(e.to_string())))?;
    if code != 1 {
        return Err(CallFailure::Definitive(Error::ServerError(status_message)));
    }
    Ok(value)
}

/// One-shot `requestTopic` call against a publisher node's slave API.
/// Returns the host and port of its TCPROS server for the topic.
pub(crate) async fn request_topic(
    peer_api: &str,
    caller_id: &str,
    topic: &str,
) -> Result<(String, u16)> {
    let body = serde_xmlrpc::request_to_string(
        "requestTopic",
        vec![
            serde_xmlrpc::to_value(caller_id).map_err(|e| Error::Serialization(e.to_string()))?,
            serde_xmlrpc::to_value(topic).map_err(|e| Error::Serialization(e.to_string()))?,
            serde_xmlrpc::to_value(vec![vec!["TCPROS".to_string()]])
                .map_err(|e| Error::Serialization(e.to_string()))?,
        ],
    )
    .map_err(|e| Error::Serialization(e.to_string()))?;
    let client = reqwest::Client::new();
    let text = client
        .post(peer_api)
        .body(body)
        .send()
        .await
        .map_err(|e| Error::Unexpected(anyhow::Error::new(e)))?
        .text()
        .await
        .map_err(|e| Error::Unexpected(anyhow::Error::new(e)))?;
    let (code, status_message, value): (i32, String, Value) =
        serde_xmlrpc::response_from_str(&text)
            .map_err(|e| Error::Serialization(e.to_string()))?;
    if code != 1 {
        return Err(Error::ServerError(status_message));
    }
    let (protocol, host, port): (String, String, i32) = serde_xmlrpc::from_value(value)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    if protocol != "TCPROS" {
        return Err(Error::ServerError(format!(
            "peer offered unsupported protocol {protocol}"
        )));
    }
    let port = u16::try_from(port)
        .map_err(|_| Error::ServerError(format!("peer offered invalid port {port}")))?;
    Ok((host, port))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_follows_the_schedule() {
        let expected_ms = [1u64, 2, 2, 4, 4, 4, 4, 8, 8, 8, 8, 16, 32, 64, 128, 256, 512, 1000];
        for (k, expected) in expected_ms.iter().enumerate() {
            assert_eq!(backoff_delay(k + 1), Duration::from_millis(*expected));
        }
    }

    #[test]
    fn backoff_saturates_at_the_last_entry() {
        assert_eq!(backoff_delay(18), Duration::from_millis(1000));
        assert_eq!(backoff_delay(100), Duration::from_millis(1000));
    }

    #[test]
    fn eighth_failure_after_seven_refusals_waits_8ms() {
        // Seven consecutive refusals consume 1, 2, 2, 4, 4, 4, 4; the next
        // delay on the schedule is 8ms
        assert_eq!(backoff_delay(8), Duration::from_millis(8));
    }
}
