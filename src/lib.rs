pub mod jsonrpc;

// 公開API
pub use jsonrpc::{
    CallError, Connection, Engine, ErrorObject, Message, PeerPair, Reply, RequestError,
    TransportConfig, Vocabulary,
};
