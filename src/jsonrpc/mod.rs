//! JSON-RPC 2.0 双方向メッセージエンジン
//!
//! 任意の双方向チャネル（ソケット、パイプ、テスト用のインメモリ実装）の上で、
//! リクエストとレスポンスの対応付け、受信メッセージの厳密な検証、
//! 型付きメソッド登録を提供します。
//!
//! ## 主要コンポーネント
//!
//! - [`coerce`]: 受信値を JSON-RPC 2.0 の文法で検証し [`Message`] に変換
//! - [`engine`]: 保留中リクエストの管理、タイムアウト、close 時の一括失敗
//! - [`registry`]: メソッド名と型付きコーデックの対応、サーバー/クライアント生成
//! - [`peer`]: 非対称な語彙を持つ二つのピアを一つの接続上で組み合わせる
//! - [`transport`]: Content-Length フレーミングによるバイトストリーム接続
//!
//! ## 使用例
//!
//! ```rust,no_run
//! use jsonrpc_duplex::jsonrpc::{
//!     Connection, IgnoreNotifications, Reply, RequestRegistry, TransportConfig,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut requests = RequestRegistry::builder();
//! let echo = requests.register_json::<Vec<String>, Vec<String>>("echo")?;
//! let requests = requests.build();
//!
//! let dispatcher = requests
//!     .server()
//!     .handle(&echo, |lines| async move { Reply::Success(lines) })
//!     .build()?;
//!
//! let connection = Connection::spawn(
//!     tokio::io::stdin(),
//!     tokio::io::stdout(),
//!     TransportConfig::default(),
//!     dispatcher,
//!     IgnoreNotifications,
//! );
//! connection.closed().await;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod coerce;
pub mod engine;
pub mod error;
pub mod handler;
pub mod message;
pub mod peer;
pub mod registry;
pub mod transport;
pub mod types;

pub use codec::{Codec, FnCodec, JsonCodec, RawCodec};
pub use coerce::coerce;
pub use engine::{Engine, WeakEngine};
pub use error::{
    CallError, CodecError, CoerceError, FailureKind, ReceiveError, RegistryError, RequestError,
    TransportError, TransportFailure,
};
pub use handler::{
    IgnoreNotifications, JsonRpcSender, MessageSink, NotificationHandler, RejectRequests, Reply,
    RequestHandler,
};
pub use message::{ErrorResponse, Message, Notification, Request, SuccessResponse};
pub use peer::{Inbound, PeerPair, PeerSide, Remote, Vocabulary};
pub use registry::{
    NotificationClient, NotificationDispatcher, NotificationMethod, NotificationRegistry,
    NotificationServer, RequestClient, RequestDispatcher, RequestMethod, RequestRegistry,
    RequestServer,
};
pub use transport::{Connection, FrameReader, FrameWriter, ShutdownReason, TransportConfig};
pub use types::{ErrorCode, ErrorObject, Id, Version};
