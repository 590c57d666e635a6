//! Request/response correlation and inbound dispatch for one connection.
//!
//! An [`Engine`] is open until [`Engine::close`] and can never reopen.
//! All mutable state (pending table, id counter, closed flag) sits behind
//! one mutex. The lock is never held while calling the sink or a handler.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace, warn};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::coerce::coerce;
use super::error::{ReceiveError, RequestError, TransportFailure};
use super::handler::{JsonRpcSender, MessageSink, NotificationHandler, Reply, RequestHandler};
use super::message::{ErrorResponse, Message, Notification, Request, SuccessResponse};
use super::types::Id;

type Resolution = Result<Value, RequestError>;

struct PendingRequest {
    resolver: oneshot::Sender<Resolution>,
    timer: Option<JoinHandle<()>>,
}

impl PendingRequest {
    /// Consumes the entry, so a request can only ever be answered once.
    fn resolve(self, outcome: Resolution) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // 呼び出し側がフューチャーを破棄済みの場合もある
        let _ = self.resolver.send(outcome);
    }
}

/// Outstanding requests keyed by correlation id
#[derive(Default)]
struct PendingTable {
    entries: BTreeMap<u64, PendingRequest>,
}

impl PendingTable {
    fn insert(&mut self, id: u64, entry: PendingRequest) {
        self.entries.insert(id, entry);
    }

    /// Removal hands back ownership; whoever takes the entry resolves it.
    fn take(&mut self, id: u64) -> Option<PendingRequest> {
        self.entries.remove(&id)
    }

    /// Every entry in ascending id order
    fn drain(&mut self) -> Vec<(u64, PendingRequest)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct EngineState {
    closed: bool,
    pending: PendingTable,
    next_id: u64,
}

struct Inner {
    state: Mutex<EngineState>,
    sink: Box<dyn MessageSink>,
    requests: Box<dyn RequestHandler>,
    notifications: Box<dyn NotificationHandler>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// JSON-RPC 2.0 engine for one logical connection.
///
/// Cloning yields another handle to the same engine. Inbound requests and
/// request timeouts run as tokio tasks, so `received_message` and
/// `request` with a timeout must be called from within a tokio runtime.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(
        sink: impl MessageSink,
        requests: impl RequestHandler,
        notifications: impl NotificationHandler,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(EngineState {
                    closed: false,
                    pending: PendingTable::default(),
                    next_id: 1,
                }),
                sink: Box::new(sink),
                requests: Box::new(requests),
                notifications: Box::new(notifications),
            }),
        }
    }

    /// Send a request and return a future for its single outcome.
    ///
    /// The request is registered and handed to the sink before this returns;
    /// the future only waits. On a closed engine nothing is sent and the
    /// future resolves with `ConnectionClosed`.
    pub fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout_ms: Option<u64>,
    ) -> impl Future<Output = Result<Value, RequestError>> + Send + 'static {
        let registered = self.register(method, params, timeout_ms);

        async move {
            match registered {
                Ok(receiver) => receiver
                    .await
                    .unwrap_or(Err(TransportFailure::ConnectionClosed.into())),
                Err(err) => Err(err),
            }
        }
    }

    fn register(
        &self,
        method: &str,
        params: Option<Value>,
        timeout_ms: Option<u64>,
    ) -> Result<oneshot::Receiver<Resolution>, RequestError> {
        let (resolver, receiver) = oneshot::channel();

        let id = {
            let mut state = self.inner.lock();
            if state.closed {
                debug!("Request {} rejected: engine closed", method);
                return Err(TransportFailure::ConnectionClosed.into());
            }
            let id = state.next_id;
            state.next_id += 1;
            // ロック中に起動: エントリ登録前にタイマーが参照することはない
            let timer = timeout_ms.map(|ms| self.arm_timer(id, ms));
            state.pending.insert(id, PendingRequest { resolver, timer });
            id
        };

        debug!("Sending request: {} (id: {})", method, id);
        self.inner
            .sink
            .send_message(Request::new(Id::from(id), method, params).into());

        Ok(receiver)
    }

    fn arm_timer(&self, id: u64, timeout_ms: u64) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;

            if let Some(inner) = inner.upgrade() {
                let expired = inner.lock().pending.take(id);
                if let Some(mut pending) = expired {
                    debug!("Request {} timed out after {}ms", id, timeout_ms);
                    // このタスク自身がタイマーなので中止するものはない
                    pending.timer = None;
                    pending.resolve(Err(TransportFailure::Timeout.into()));
                }
            }
        })
    }

    /// Send a notification. No id, no correlation.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportFailure> {
        if self.is_closed() {
            debug!("Notification {} rejected: engine closed", method);
            return Err(TransportFailure::ConnectionClosed);
        }

        debug!("Sending notification: {}", method);
        self.inner
            .sink
            .send_message(Notification::new(method, params).into());
        Ok(())
    }

    /// Feed one decoded inbound value.
    ///
    /// Validation failures and responses for unknown ids are returned
    /// without side effects; the caller decides whether to drop the channel.
    ///
    /// # Panics
    ///
    /// If the engine is closed.
    pub fn received_message(&self, raw: &Value) -> Result<(), ReceiveError> {
        assert!(!self.is_closed(), "received_message called on a closed engine");

        match coerce(raw)? {
            Message::Notification(notification) => {
                trace!("Received notification: {}", notification.method);
                self.inner.notifications.handle_notification(notification);
                Ok(())
            }
            Message::Success(response) => self.resolve(response.id, Ok(response.result)),
            Message::Error(response) => {
                self.resolve(response.id, Err(RequestError::Remote(response.error)))
            }
            Message::Request(request) => {
                trace!("Received request: {} (id: {})", request.method, request.id);
                self.dispatch(request);
                Ok(())
            }
        }
    }

    fn resolve(&self, id: Id, outcome: Resolution) -> Result<(), ReceiveError> {
        let pending = match &id {
            Id::Number(n) => match u64::try_from(*n) {
                Ok(n) => self.inner.lock().pending.take(n),
                Err(_) => None,
            },
            Id::String(_) => None,
        };

        match pending {
            Some(pending) => {
                pending.resolve(outcome);
                Ok(())
            }
            None => {
                warn!("Response for non-pending id {}", id);
                Err(ReceiveError::NonPendingId(id))
            }
        }
    }

    fn dispatch(&self, request: Request) {
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let id = request.id.clone();
            let method = request.method.clone();

            let message: Message = match inner.requests.handle_request(request).await {
                Reply::Success(result) => SuccessResponse::new(id.clone(), result).into(),
                Reply::Error(error) => ErrorResponse::new(id.clone(), error).into(),
                Reply::Silent => {
                    trace!("No response for {} (id: {})", method, id);
                    return;
                }
            };

            if inner.lock().closed {
                debug!("Dropping response to {} (id: {}): engine closed", method, id);
                return;
            }
            inner.sink.send_message(message);
        });
    }

    /// Fail every outstanding request with `ConnectionClosed` and stop.
    ///
    /// # Panics
    ///
    /// If the engine is already closed.
    pub fn close(&self) {
        let drained = {
            let mut state = self.inner.lock();
            assert!(!state.closed, "close called on a closed engine");
            state.closed = true;
            state.pending.drain()
        };

        debug!("Closing engine with {} pending requests", drained.len());
        for (_, pending) in drained {
            pending.resolve(Err(TransportFailure::ConnectionClosed.into()));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// A handle that does not keep the engine alive.
    ///
    /// Handlers that call back into their own connection should hold this
    /// instead of an `Engine`, since the engine owns the handlers.
    pub fn downgrade(&self) -> WeakEngine {
        WeakEngine {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Non-owning handle to an [`Engine`].
///
/// Sends fail with `ConnectionClosed` once every `Engine` handle is gone.
#[derive(Clone)]
pub struct WeakEngine {
    inner: Weak<Inner>,
}

impl WeakEngine {
    pub fn upgrade(&self) -> Option<Engine> {
        self.inner.upgrade().map(|inner| Engine { inner })
    }
}

#[async_trait]
impl JsonRpcSender for Engine {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout_ms: Option<u64>,
    ) -> Result<Value, RequestError> {
        self.request(method, params, timeout_ms).await
    }

    fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), TransportFailure> {
        self.notify(method, params)
    }
}

#[async_trait]
impl JsonRpcSender for WeakEngine {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout_ms: Option<u64>,
    ) -> Result<Value, RequestError> {
        // 待機前に強参照を手放す
        let response = match self.upgrade() {
            Some(engine) => engine.request(method, params, timeout_ms),
            None => {
                debug!("Request {} rejected: engine dropped", method);
                return Err(TransportFailure::ConnectionClosed.into());
            }
        };
        response.await
    }

    fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), TransportFailure> {
        match self.upgrade() {
            Some(engine) => engine.notify(method, params),
            None => {
                debug!("Notification {} rejected: engine dropped", method);
                Err(TransportFailure::ConnectionClosed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::error::CoerceError;
    use crate::jsonrpc::handler::{IgnoreNotifications, RejectRequests};
    use crate::jsonrpc::types::ErrorObject;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    // 一部の特殊メソッド以外はparamsをそのまま返す
    struct TestHandler;

    #[async_trait]
    impl RequestHandler for TestHandler {
        async fn handle_request(&self, request: Request) -> Reply {
            match request.method.as_str() {
                "ping" => Reply::Success(json!("pong")),
                "echo" => Reply::Success(request.params.unwrap_or(Value::Null)),
                "silent" => Reply::Silent,
                _ => Reply::Error(ErrorObject::method_not_found(&request.method)),
            }
        }
    }

    #[derive(Clone, Default)]
    struct RecordingNotifications {
        received: Arc<StdMutex<Vec<Notification>>>,
    }

    impl NotificationHandler for RecordingNotifications {
        fn handle_notification(&self, notification: Notification) {
            self.received.lock().unwrap().push(notification);
        }
    }

    fn engine() -> (Engine, mpsc::UnboundedReceiver<Message>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (tx, rx) = mpsc::unbounded_channel();
        (Engine::new(tx, TestHandler, IgnoreNotifications), rx)
    }

    fn sent_request_id(message: Message) -> i64 {
        match message {
            Message::Request(Request { id: Id::Number(id), .. }) => id,
            other => panic!("Expected Request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_resolves_with_result() {
        let (engine, mut rx) = engine();

        let response = engine.request("echo", Some(json!({"x": 1})), None);
        let id = sent_request_id(rx.recv().await.unwrap());
        assert_eq!(engine.pending_count(), 1);

        engine
            .received_message(&json!({"jsonrpc": "2.0", "id": id, "result": {"x": 1}}))
            .unwrap();

        assert_eq!(response.await.unwrap(), json!({"x": 1}));
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_is_sent_before_polling() {
        let (engine, mut rx) = engine();

        let _response = engine.request("ping", None, None);
        let message = rx.try_recv().unwrap();

        assert_eq!(message.method(), Some("ping"));
        assert_eq!(
            message.to_value().unwrap(),
            json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})
        );
    }

    #[tokio::test]
    async fn test_ids_increase_and_are_never_reused() {
        let (engine, mut rx) = engine();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let _ = engine.request("ping", None, None);
            ids.push(sent_request_id(rx.recv().await.unwrap()));
        }
        engine
            .received_message(&json!({"jsonrpc": "2.0", "id": ids[2], "result": 0}))
            .unwrap();
        let _ = engine.request("ping", None, None);
        ids.push(sent_request_id(rx.recv().await.unwrap()));

        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_error_response_is_remote_error() {
        let (engine, mut rx) = engine();

        let response = engine.request("boom", None, None);
        let id = sent_request_id(rx.recv().await.unwrap());
        engine
            .received_message(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": "Method not found"}
            }))
            .unwrap();

        match response.await {
            Err(RequestError::Remote(error)) => {
                assert_eq!(error.code, -32601);
                assert_eq!(error.message, "Method not found");
            }
            other => panic!("Expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_responses_match_by_id_not_arrival_order() {
        let (engine, mut rx) = engine();

        let first = engine.request("echo", Some(json!([1])), None);
        let second = engine.request("echo", Some(json!([2])), None);
        let first_id = sent_request_id(rx.recv().await.unwrap());
        let second_id = sent_request_id(rx.recv().await.unwrap());

        engine
            .received_message(&json!({"jsonrpc": "2.0", "id": second_id, "result": "two"}))
            .unwrap();
        engine
            .received_message(&json!({"jsonrpc": "2.0", "id": first_id, "result": "one"}))
            .unwrap();

        assert_eq!(first.await.unwrap(), json!("one"));
        assert_eq!(second.await.unwrap(), json!("two"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let (engine, mut rx) = engine();

        let started = Instant::now();
        let response = engine.request("ping", None, Some(100));
        let id = sent_request_id(rx.recv().await.unwrap());

        let err = response.await.unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(err, RequestError::Transport(TransportFailure::Timeout));
        assert_eq!(err.to_error_object().message, "timeout");
        assert_eq!(engine.pending_count(), 0);

        // 遅れて届いた応答は古いだけでクラッシュではない
        let late = engine.received_message(&json!({"jsonrpc": "2.0", "id": id, "result": 1}));
        assert_eq!(late, Err(ReceiveError::NonPendingId(Id::Number(id))));
    }

    #[tokio::test]
    async fn test_response_beats_timeout() {
        let (engine, mut rx) = engine();

        let response = engine.request("ping", None, Some(50));
        let id = sent_request_id(rx.recv().await.unwrap());
        engine
            .received_message(&json!({"jsonrpc": "2.0", "id": id, "result": "pong"}))
            .unwrap();

        assert_eq!(response.await.unwrap(), json!("pong"));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn test_pending_table_drains_in_id_order() {
        let mut table = PendingTable::default();
        let mut receivers = Vec::new();
        for id in [3, 1, 2] {
            let (resolver, receiver) = oneshot::channel();
            table.insert(id, PendingRequest { resolver, timer: None });
            receivers.push(receiver);
        }

        let ids: Vec<u64> = table.drain().into_iter().map(|(id, _)| id).collect();

        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_close_drains_pending_requests() {
        let (engine, _rx) = engine();

        let first = engine.request("ping", None, Some(5_000));
        let second = engine.request("ping", None, None);
        assert_eq!(engine.pending_count(), 2);
        // 弱参照を持つのは起動中のタイマーだけ
        assert_eq!(Arc::weak_count(&engine.inner), 1);

        engine.close();

        assert!(engine.is_closed());
        assert_eq!(engine.pending_count(), 0);

        // 結果はclose自体が届けている
        let (first, second) = tokio::time::timeout(Duration::ZERO, async {
            (first.await, second.await)
        })
        .await
        .unwrap();
        let closed = RequestError::Transport(TransportFailure::ConnectionClosed);
        assert_eq!(first.unwrap_err(), closed);
        assert_eq!(second.unwrap_err(), closed);

        // 中止されたタイマーは発火予定より前にエンジンを手放す
        tokio::time::timeout(Duration::from_secs(1), async {
            while Arc::weak_count(&engine.inner) > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_weak_engine_sends_until_dropped() {
        let (engine, mut rx) = engine();
        let weak = engine.downgrade();

        let (result, ()) = tokio::join!(weak.send_request("echo", Some(json!([1])), None), async {
            let id = sent_request_id(rx.recv().await.unwrap());
            engine
                .received_message(&json!({"jsonrpc": "2.0", "id": id, "result": [1]}))
                .unwrap();
        });
        assert_eq!(result.unwrap(), json!([1]));
        weak.send_notification("update", None).unwrap();
        assert_eq!(rx.recv().await.unwrap().method(), Some("update"));

        drop(engine);

        assert!(weak.upgrade().is_none());
        assert_eq!(
            weak.send_request("ping", None, None).await.unwrap_err(),
            RequestError::Transport(TransportFailure::ConnectionClosed)
        );
        assert_eq!(
            weak.send_notification("update", None),
            Err(TransportFailure::ConnectionClosed)
        );
        // シンクはエンジンと一緒に破棄される
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_request_after_close_is_rejected() {
        let (engine, mut rx) = engine();
        engine.close();

        let err = engine.request("ping", None, None).await.unwrap_err();
        assert_eq!(err.kind(), crate::jsonrpc::error::FailureKind::ConnectionClosed);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notify() {
        let (engine, mut rx) = engine();

        engine.notify("update", Some(json!([1, 2]))).unwrap();
        assert_eq!(
            rx.recv().await.unwrap().to_value().unwrap(),
            json!({"jsonrpc": "2.0", "method": "update", "params": [1, 2]})
        );
        assert_eq!(engine.pending_count(), 0);

        engine.close();
        assert_eq!(
            engine.notify("update", None),
            Err(TransportFailure::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn test_notification_handled_synchronously() {
        let (tx, _rx) = mpsc::unbounded_channel::<Message>();
        let notifications = RecordingNotifications::default();
        let engine = Engine::new(tx, RejectRequests, notifications.clone());

        engine
            .received_message(&json!({"jsonrpc": "2.0", "method": "log", "params": ["hi"]}))
            .unwrap();

        let received = notifications.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].method, "log");
        assert_eq!(received[0].params, Some(json!(["hi"])));
    }

    #[tokio::test]
    async fn test_inbound_request_gets_success_response() {
        let (engine, mut rx) = engine();

        engine
            .received_message(&json!({"jsonrpc": "2.0", "id": "a", "method": "ping"}))
            .unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            Message::Success(SuccessResponse::new(Id::from("a"), json!("pong")))
        );
    }

    #[tokio::test]
    async fn test_inbound_request_gets_error_response() {
        let (engine, mut rx) = engine();

        engine
            .received_message(&json!({"jsonrpc": "2.0", "id": 5, "method": "nope"}))
            .unwrap();

        match rx.recv().await.unwrap() {
            Message::Error(response) => {
                assert_eq!(response.id, Id::Number(5));
                assert_eq!(response.error.code, -32601);
            }
            other => panic!("Expected error response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_silent_reply_sends_nothing() {
        let (engine, mut rx) = engine();

        engine
            .received_message(&json!({"jsonrpc": "2.0", "id": 1, "method": "silent"}))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_suspended_handler_does_not_block_other_traffic() {
        struct GatedHandler {
            gate: StdMutex<Option<oneshot::Receiver<()>>>,
        }

        #[async_trait]
        impl RequestHandler for GatedHandler {
            async fn handle_request(&self, _request: Request) -> Reply {
                let gate = self.gate.lock().unwrap().take();
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                Reply::Success(json!("done"))
            }
        }

        let (open_gate, gate) = oneshot::channel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = Engine::new(
            tx,
            GatedHandler {
                gate: StdMutex::new(Some(gate)),
            },
            IgnoreNotifications,
        );

        engine
            .received_message(&json!({"jsonrpc": "2.0", "id": 1, "method": "slow"}))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // ハンドラー待機中も送信と応答の対応付けは動き続ける
        let response = engine.request("ping", None, None);
        let id = sent_request_id(rx.recv().await.unwrap());
        engine
            .received_message(&json!({"jsonrpc": "2.0", "id": id, "result": "pong"}))
            .unwrap();
        assert_eq!(response.await.unwrap(), json!("pong"));

        open_gate.send(()).unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            Message::Success(SuccessResponse::new(Id::Number(1), json!("done")))
        );
    }

    #[tokio::test]
    async fn test_invalid_message_has_no_side_effects() {
        let (engine, mut rx) = engine();
        let _pending = engine.request("ping", None, None);
        let _ = rx.recv().await;

        let err = engine
            .received_message(&json!({"jsonrpc": "2.0", "id": 1, "result": "ok", "error": {"code": -32600, "message": "x"}}))
            .unwrap_err();

        assert_eq!(err, ReceiveError::Invalid(CoerceError::BothResultAndError));
        assert_eq!(engine.pending_count(), 1);
        assert!(!engine.is_closed());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_response_ids() {
        let (engine, _rx) = engine();

        assert_eq!(
            engine.received_message(&json!({"jsonrpc": "2.0", "id": 99, "result": 1})),
            Err(ReceiveError::NonPendingId(Id::Number(99)))
        );
        assert_eq!(
            engine.received_message(&json!({"jsonrpc": "2.0", "id": "x", "result": 1})),
            Err(ReceiveError::NonPendingId(Id::from("x")))
        );
        assert_eq!(
            engine.received_message(&json!({"jsonrpc": "2.0", "id": -1, "result": 1})),
            Err(ReceiveError::NonPendingId(Id::Number(-1)))
        );
    }

    #[tokio::test]
    async fn test_duplicate_response_is_rejected() {
        let (engine, mut rx) = engine();

        let response = engine.request("ping", None, None);
        let id = sent_request_id(rx.recv().await.unwrap());
        let answer = json!({"jsonrpc": "2.0", "id": id, "result": 1});

        engine.received_message(&answer).unwrap();
        assert!(matches!(
            engine.received_message(&answer),
            Err(ReceiveError::NonPendingId(_))
        ));
        assert_eq!(response.await.unwrap(), json!(1));
    }

    #[tokio::test]
    #[should_panic(expected = "received_message called on a closed engine")]
    async fn test_receive_after_close_panics() {
        let (engine, _rx) = engine();
        engine.close();
        let _ = engine.received_message(&json!({"jsonrpc": "2.0", "method": "m"}));
    }

    #[tokio::test]
    #[should_panic(expected = "close called on a closed engine")]
    async fn test_double_close_panics() {
        let (engine, _rx) = engine();
        engine.close();
        engine.close();
    }

    #[tokio::test]
    async fn test_closure_sink() {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let sink = {
            let sent = sent.clone();
            move |message: Message| sent.lock().unwrap().push(message)
        };
        let engine = Engine::new(sink, RejectRequests, IgnoreNotifications);

        engine.notify("hello", None).unwrap();
        assert_eq!(sent.lock().unwrap().len(), 1);
    }
}
