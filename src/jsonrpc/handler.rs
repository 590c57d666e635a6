use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::error::{RequestError, TransportFailure};
use super::message::{Message, Notification, Request};
use super::types::ErrorObject;

/// Synchronous hand-off of outbound messages to a transport.
///
/// Implementations must keep call order; the engine never retries.
pub trait MessageSink: Send + Sync + 'static {
    fn send_message(&self, message: Message);
}

impl MessageSink for mpsc::UnboundedSender<Message> {
    fn send_message(&self, message: Message) {
        if self.send(message).is_err() {
            log::debug!("Outbound channel closed, dropping message");
        }
    }
}

impl<F> MessageSink for F
where
    F: Fn(Message) + Send + Sync + 'static,
{
    fn send_message(&self, message: Message) {
        self(message)
    }
}

/// What a request handler wants sent back.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply<T = Value> {
    Success(T),
    Error(ErrorObject),
    /// Understood, intentionally unanswered
    Silent,
}

impl<T> Reply<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Reply<U> {
        match self {
            Reply::Success(value) => Reply::Success(f(value)),
            Reply::Error(error) => Reply::Error(error),
            Reply::Silent => Reply::Silent,
        }
    }
}

impl<T> From<Result<T, ErrorObject>> for Reply<T> {
    fn from(result: Result<T, ErrorObject>) -> Self {
        match result {
            Ok(value) => Reply::Success(value),
            Err(error) => Reply::Error(error),
        }
    }
}

#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle_request(&self, request: Request) -> Reply;
}

pub trait NotificationHandler: Send + Sync + 'static {
    fn handle_notification(&self, notification: Notification);
}

/// Raw outbound side of a connection, as seen by typed clients.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JsonRpcSender: Send + Sync {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout_ms: Option<u64>,
    ) -> Result<Value, RequestError>;

    fn send_notification(&self, method: &str, params: Option<Value>)
        -> Result<(), TransportFailure>;
}

/// Answers every request with "method not found"
pub struct RejectRequests;

#[async_trait]
impl RequestHandler for RejectRequests {
    async fn handle_request(&self, request: Request) -> Reply {
        Reply::Error(ErrorObject::method_not_found(&request.method))
    }
}

/// Drops every notification
pub struct IgnoreNotifications;

impl NotificationHandler for IgnoreNotifications {
    fn handle_notification(&self, notification: Notification) {
        log::trace!("Ignoring notification: {}", notification.method);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reply_from_result() {
        let ok: Reply<i32> = Ok(3).into();
        assert_eq!(ok, Reply::Success(3));

        let err: Reply<i32> = Err(ErrorObject::internal_error("x")).into();
        assert!(matches!(err, Reply::Error(e) if e.code == -32603));
    }

    #[test]
    fn test_reply_map_keeps_silent() {
        let silent: Reply<i32> = Reply::Silent;
        assert_eq!(silent.map(|n| n + 1), Reply::Silent);
        assert_eq!(Reply::Success(1).map(|n| json!(n)), Reply::Success(json!(1)));
    }

    #[tokio::test]
    async fn test_channel_sink_preserves_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for method in ["a", "b", "c"] {
            tx.send_message(Message::from(Notification::new(method, None)));
        }
        for method in ["a", "b", "c"] {
            assert_eq!(rx.recv().await.unwrap().method(), Some(method));
        }
    }

    #[tokio::test]
    async fn test_reject_requests() {
        let reply = RejectRequests
            .handle_request(Request::new(1u64.into(), "nope", None))
            .await;
        assert!(matches!(reply, Reply::Error(e) if e.code == -32601));
    }
}
