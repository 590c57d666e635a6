//! Two peers with asymmetric vocabularies sharing one engine per connection.
//!
//! Each side serves its own vocabulary and calls into the other one. Both
//! sides are the same [`PeerSide`] adapter with the roles swapped.

use std::sync::Arc;

use super::engine::Engine;
use super::error::RegistryError;
use super::handler::{JsonRpcSender, MessageSink};
use super::registry::{
    NotificationClient, NotificationDispatcher, NotificationRegistry, NotificationServer,
    RequestClient, RequestDispatcher, RequestRegistry, RequestServer,
};

/// Request and notification methods one peer serves
#[derive(Debug, Clone)]
pub struct Vocabulary {
    pub requests: RequestRegistry,
    pub notifications: NotificationRegistry,
}

impl Vocabulary {
    pub fn new(requests: RequestRegistry, notifications: NotificationRegistry) -> Self {
        Self {
            requests,
            notifications,
        }
    }

    /// A peer that serves nothing
    pub fn empty() -> Self {
        Self::new(
            RequestRegistry::builder().build(),
            NotificationRegistry::builder().build(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct PeerPair {
    a: Vocabulary,
    b: Vocabulary,
}

impl PeerPair {
    pub fn new(a: Vocabulary, b: Vocabulary) -> Self {
        Self { a, b }
    }

    /// Serves A's vocabulary and calls B's
    pub fn side_a(&self) -> PeerSide {
        PeerSide::new(self.a.clone(), self.b.clone())
    }

    /// Serves B's vocabulary and calls A's
    pub fn side_b(&self) -> PeerSide {
        PeerSide::new(self.b.clone(), self.a.clone())
    }
}

/// One end of a connection: inbound traffic goes through `own`, outbound
/// typed calls through `remote`.
#[derive(Debug, Clone)]
pub struct PeerSide {
    own: Vocabulary,
    remote: Vocabulary,
}

impl PeerSide {
    pub fn new(own: Vocabulary, remote: Vocabulary) -> Self {
        Self { own, remote }
    }

    pub fn own_vocabulary(&self) -> &Vocabulary {
        &self.own
    }

    pub fn remote_vocabulary(&self) -> &Vocabulary {
        &self.remote
    }

    /// The other end of the same connection
    pub fn reversed(&self) -> PeerSide {
        PeerSide::new(self.remote.clone(), self.own.clone())
    }

    pub fn request_server(&self) -> RequestServer {
        self.own.requests.server()
    }

    pub fn notification_server(&self) -> NotificationServer {
        self.own.notifications.server()
    }

    /// Finish both servers into the engine's inbound handler slots
    pub fn inbound(
        &self,
        requests: RequestServer,
        notifications: NotificationServer,
    ) -> Result<Inbound, RegistryError> {
        Ok(Inbound {
            requests: requests.build()?,
            notifications: notifications.build()?,
        })
    }

    /// Typed clients for the remote vocabulary over one connection's
    /// raw outbound side.
    ///
    /// A remote reached from this side's own handlers should wrap
    /// [`Engine::downgrade`], or the engine keeps itself alive.
    pub fn remote(&self, outbound: Arc<dyn JsonRpcSender>) -> Remote {
        Remote {
            requests: self.remote.requests.client(Arc::clone(&outbound)),
            notifications: self.remote.notifications.client(outbound),
        }
    }
}

/// Inbound dispatch targets for one engine
pub struct Inbound {
    pub requests: RequestDispatcher,
    pub notifications: NotificationDispatcher,
}

impl Inbound {
    pub fn into_engine(self, sink: impl MessageSink) -> Engine {
        Engine::new(sink, self.requests, self.notifications)
    }
}

/// Typed outbound calls into the remote peer
#[derive(Clone)]
pub struct Remote {
    pub requests: RequestClient,
    pub notifications: NotificationClient,
}

impl Remote {
    pub fn with_default_timeout(mut self, timeout_ms: u64) -> Self {
        self.requests = self.requests.with_default_timeout(timeout_ms);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::error::CallError;
    use crate::jsonrpc::handler::Reply;
    use crate::jsonrpc::message::Message;
    use crate::jsonrpc::registry::{NotificationMethod, RequestMethod};
    use crate::jsonrpc::types::ErrorObject;
    use serde::{Deserialize, Serialize};
    use std::sync::{Mutex, OnceLock};
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OpenParams {
        path: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct SavedParams {
        path: String,
    }

    // エディタ側が提供するメソッド
    struct Editor {
        vocab: Vocabulary,
        open: RequestMethod<OpenParams, usize>,
        saved: NotificationMethod<SavedParams>,
    }

    // 解析側が提供するメソッド
    struct Analyzer {
        vocab: Vocabulary,
        hover: RequestMethod<OpenParams, String>,
        ping: RequestMethod<(), String>,
    }

    fn editor() -> Editor {
        let mut requests = RequestRegistry::builder();
        let open = requests.register_json("open").unwrap();
        let mut notifications = NotificationRegistry::builder();
        let saved = notifications.register_json("saved").unwrap();
        Editor {
            vocab: Vocabulary::new(requests.build(), notifications.build()),
            open,
            saved,
        }
    }

    fn analyzer() -> Analyzer {
        let mut requests = RequestRegistry::builder();
        let hover = requests.register_json("hover").unwrap();
        let ping = requests.register_json("ping").unwrap();
        Analyzer {
            vocab: Vocabulary::new(requests.build(), NotificationRegistry::builder().build()),
            hover,
            ping,
        }
    }

    // 二つのエンジンをチャンネルで相互接続
    fn link(a: Inbound, b: Inbound) -> (Engine, Engine) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = a.into_engine(a_tx);
        let b = b.into_engine(b_tx);
        pump(a_rx, b.clone());
        pump(b_rx, a.clone());
        (a, b)
    }

    fn pump(mut rx: mpsc::UnboundedReceiver<Message>, target: Engine) {
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if target.is_closed() {
                    break;
                }
                target
                    .received_message(&message.to_value().unwrap())
                    .unwrap();
            }
        });
    }

    #[test]
    fn test_sides_mirror_each_other() {
        let pair = PeerPair::new(editor().vocab, analyzer().vocab);
        let a = pair.side_a();
        let b = pair.side_b();

        let names = |v: &Vocabulary| v.requests.methods().map(String::from).collect::<Vec<_>>();
        assert_eq!(names(a.own_vocabulary()), vec!["open"]);
        assert_eq!(names(a.remote_vocabulary()), vec!["hover", "ping"]);
        assert_eq!(names(b.own_vocabulary()), names(a.remote_vocabulary()));
        assert_eq!(names(a.reversed().own_vocabulary()), names(b.own_vocabulary()));
    }

    #[test]
    fn test_inbound_requires_handlers() {
        let pair = PeerPair::new(editor().vocab, analyzer().vocab);
        let side = pair.side_a();
        let err = side
            .inbound(side.request_server(), side.notification_server())
            .err()
            .unwrap();
        assert_eq!(err, RegistryError::MissingHandler("open".to_string()));
    }

    #[tokio::test]
    async fn test_asymmetric_calls_in_both_directions() {
        let ed = editor();
        let an = analyzer();
        let pair = PeerPair::new(ed.vocab.clone(), an.vocab.clone());
        let (side_a, side_b) = (pair.side_a(), pair.side_b());

        let saved = Arc::new(Mutex::new(Vec::new()));
        let a_inbound = {
            let saved = saved.clone();
            side_a
                .inbound(
                    side_a
                        .request_server()
                        .handle(&ed.open, |p: OpenParams| async move { Reply::Success(p.path.len()) }),
                    side_a
                        .notification_server()
                        .handle(&ed.saved, move |p: SavedParams| saved.lock().unwrap().push(p.path)),
                )
                .unwrap()
        };

        // hoverは応答前にエディタへopenを依頼する
        let b_remote: Arc<OnceLock<Remote>> = Arc::new(OnceLock::new());
        let b_inbound = {
            let b_remote = b_remote.clone();
            let open = ed.open.clone();
            side_b
                .inbound(
                    side_b
                        .request_server()
                        .handle(&an.hover, move |p: OpenParams| {
                            let b_remote = b_remote.clone();
                            let open = open.clone();
                            async move {
                                let remote = b_remote.get().unwrap();
                                match remote.requests.call(&open, p.clone()).await {
                                    Ok(len) => Reply::Success(format!("{}: {} bytes", p.path, len)),
                                    Err(err) => Reply::Error(ErrorObject::internal_error(err.to_string())),
                                }
                            }
                        })
                        .handle(&an.ping, |_| async { Reply::Success("pong".to_string()) }),
                    side_b.notification_server(),
                )
                .unwrap()
        };

        let (a, b) = link(a_inbound, b_inbound);
        let a_remote = side_a.remote(Arc::new(a.clone())).with_default_timeout(1000);
        b_remote.set(side_b.remote(Arc::new(b.downgrade()))).ok().unwrap();

        assert_eq!(a_remote.requests.call(&an.ping, ()).await.unwrap(), "pong");
        assert_eq!(
            a_remote
                .requests
                .call(&an.hover, OpenParams { path: "main.rs".to_string() })
                .await
                .unwrap(),
            "main.rs: 7 bytes"
        );

        let b_side = b_remote.get().unwrap();
        b_side
            .notifications
            .notify(&ed.saved, SavedParams { path: "lib.rs".to_string() })
            .unwrap();
        assert_eq!(
            b_side
                .requests
                .call(&ed.open, OpenParams { path: "ab".to_string() })
                .await
                .unwrap(),
            2
        );
        assert_eq!(*saved.lock().unwrap(), vec!["lib.rs".to_string()]);

        // 自分側の語彙のキーはリモートに対して呼べない
        let err = a_remote
            .requests
            .call(&ed.open, OpenParams { path: "x".to_string() })
            .await
            .unwrap_err();
        assert_eq!(err, CallError::UnknownMethod("open".to_string()));

        a.close();
        b.close();
    }

    #[tokio::test]
    async fn test_engine_with_weak_remote_in_handler_is_freed() {
        let ed = editor();
        let an = analyzer();
        let pair = PeerPair::new(an.vocab.clone(), ed.vocab.clone());
        let side = pair.side_a();

        let slot: Arc<OnceLock<Remote>> = Arc::new(OnceLock::new());
        let inbound = {
            let slot = slot.clone();
            let open = ed.open.clone();
            side.inbound(
                side.request_server()
                    .handle(&an.hover, move |p: OpenParams| {
                        let slot = slot.clone();
                        let open = open.clone();
                        async move {
                            match slot.get() {
                                Some(remote) => match remote.requests.call(&open, p).await {
                                    Ok(len) => Reply::Success(len.to_string()),
                                    Err(err) => Reply::Error(ErrorObject::internal_error(err.to_string())),
                                },
                                None => Reply::Silent,
                            }
                        }
                    })
                    .handle(&an.ping, |_| async { Reply::Success("pong".to_string()) }),
                side.notification_server(),
            )
            .unwrap()
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let engine = inbound.into_engine(tx);
        let remote = side.remote(Arc::new(engine.downgrade()));
        slot.set(remote.clone()).ok().unwrap();

        engine.close();
        drop(engine);
        drop(slot);

        // エンジン破棄でシンクも破棄され、チャンネルが閉じる
        let closed = tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv()).await;
        assert!(matches!(closed, Ok(None)));
        assert!(remote
            .requests
            .call(&ed.open, OpenParams { path: "x".to_string() })
            .await
            .unwrap_err()
            .is_connection_closed());
    }

    #[tokio::test]
    async fn test_remote_fails_after_close() {
        let an = analyzer();
        let pair = PeerPair::new(Vocabulary::empty(), an.vocab.clone());
        let side_a = pair.side_a();
        let inbound = side_a
            .inbound(side_a.request_server(), side_a.notification_server())
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel::<Message>();
        let engine = inbound.into_engine(tx);
        let remote = side_a.remote(Arc::new(engine.clone()));

        engine.close();
        assert!(remote
            .requests
            .call(&an.ping, ())
            .await
            .unwrap_err()
            .is_connection_closed());
    }
}
