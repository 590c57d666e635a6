//! Typed method vocabularies.
//!
//! A registry fixes which method names exist and how their params and
//! results are encoded. From it come a server-side dispatcher that plugs
//! into the engine's handler slots and a client-side typed caller that
//! runs over any [`JsonRpcSender`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::codec::{Codec, JsonCodec};
use super::error::{CallError, CodecError, RegistryError};
use super::handler::{JsonRpcSender, NotificationHandler, Reply, RequestHandler};
use super::message::{Notification, Request};
use super::types::ErrorObject;

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Method names of one registry, shared by its clients and servers
#[derive(Debug, Clone)]
struct Vocab {
    id: u64,
    names: Arc<BTreeSet<String>>,
}

#[derive(Debug)]
struct VocabBuilder {
    id: u64,
    names: BTreeSet<String>,
}

impl VocabBuilder {
    fn new() -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            names: BTreeSet::new(),
        }
    }

    fn add(&mut self, name: &str) -> Result<Arc<str>, RegistryError> {
        if !self.names.insert(name.to_string()) {
            return Err(RegistryError::DuplicateMethod(name.to_string()));
        }
        Ok(Arc::from(name))
    }

    fn build(self) -> Vocab {
        Vocab {
            id: self.id,
            names: Arc::new(self.names),
        }
    }
}

impl Vocab {
    fn missing_handler<V>(&self, handlers: &HashMap<String, V>) -> Option<&str> {
        self.names
            .iter()
            .find(|name| !handlers.contains_key(*name))
            .map(String::as_str)
    }
}

fn encode_params<P: 'static>(codec: &dyn Codec<P>, params: &P) -> Result<Option<Value>, CallError> {
    match codec.encode(params).map_err(CallError::EncodeParams)? {
        Value::Null => Ok(None),
        value @ (Value::Array(_) | Value::Object(_)) => Ok(Some(value)),
        _ => Err(CallError::EncodeParams(CodecError::new(
            "params must encode to an array or object",
        ))),
    }
}

// ---------------------------------------------------------------------------
// リクエスト
// ---------------------------------------------------------------------------

/// Typed key for a registered request method
pub struct RequestMethod<P, R> {
    name: Arc<str>,
    registry: u64,
    params: Arc<dyn Codec<P>>,
    result: Arc<dyn Codec<R>>,
}

impl<P, R> RequestMethod<P, R> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<P, R> Clone for RequestMethod<P, R> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            registry: self.registry,
            params: Arc::clone(&self.params),
            result: Arc::clone(&self.result),
        }
    }
}

impl<P, R> fmt::Debug for RequestMethod<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestMethod")
            .field("name", &self.name)
            .finish()
    }
}

/// Immutable set of request methods
#[derive(Debug, Clone)]
pub struct RequestRegistry {
    vocab: Vocab,
}

#[derive(Debug)]
pub struct RequestRegistryBuilder {
    vocab: VocabBuilder,
}

impl RequestRegistry {
    pub fn builder() -> RequestRegistryBuilder {
        RequestRegistryBuilder {
            vocab: VocabBuilder::new(),
        }
    }

    pub fn contains(&self, method: &str) -> bool {
        self.vocab.names.contains(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.vocab.names.iter().map(String::as_str)
    }

    /// Start binding handlers to this registry's methods
    pub fn server(&self) -> RequestServer {
        RequestServer::new(self.clone())
    }

    pub fn client(&self, sender: Arc<dyn JsonRpcSender>) -> RequestClient {
        RequestClient::new(self, sender)
    }
}

impl RequestRegistryBuilder {
    pub fn register<P, R>(
        &mut self,
        name: &str,
        params: impl Codec<P>,
        result: impl Codec<R>,
    ) -> Result<RequestMethod<P, R>, RegistryError>
    where
        P: 'static,
        R: 'static,
    {
        Ok(RequestMethod {
            name: self.vocab.add(name)?,
            registry: self.vocab.id,
            params: Arc::new(params),
            result: Arc::new(result),
        })
    }

    /// Register with serde-backed codecs for both params and result
    pub fn register_json<P, R>(&mut self, name: &str) -> Result<RequestMethod<P, R>, RegistryError>
    where
        P: Serialize + DeserializeOwned + 'static,
        R: Serialize + DeserializeOwned + 'static,
    {
        self.register(name, JsonCodec::<P>::new(), JsonCodec::<R>::new())
    }

    pub fn build(self) -> RequestRegistry {
        RequestRegistry {
            vocab: self.vocab.build(),
        }
    }
}

type ErasedRequestHandler = Box<dyn Fn(&Value) -> Result<BoxFuture<Reply>, CodecError> + Send + Sync>;
type UnknownRequestFallback = Box<dyn Fn(&Request) -> Reply + Send + Sync>;
type InvalidRequestFallback = Box<dyn Fn(&Request, CodecError) -> Reply + Send + Sync>;

/// Builder for the dispatcher serving one request registry
pub struct RequestServer {
    registry: RequestRegistry,
    handlers: HashMap<String, ErasedRequestHandler>,
    unknown_method: UnknownRequestFallback,
    invalid_params: InvalidRequestFallback,
    foreign: Option<String>,
}

impl RequestServer {
    fn new(registry: RequestRegistry) -> Self {
        Self {
            registry,
            handlers: HashMap::new(),
            unknown_method: Box::new(|request: &Request| {
                Reply::Error(ErrorObject::method_not_found(&request.method))
            }),
            invalid_params: Box::new(|_: &Request, err: CodecError| {
                Reply::Error(ErrorObject::invalid_params(err.0))
            }),
            foreign: None,
        }
    }

    /// Bind the handler for one method. The handler sees decoded params;
    /// its successful result is encoded with the method's result codec.
    pub fn handle<P, R, F, Fut>(mut self, method: &RequestMethod<P, R>, handler: F) -> Self
    where
        P: 'static,
        R: 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Reply<R>> + Send + 'static,
    {
        if method.registry != self.registry.vocab.id {
            self.foreign.get_or_insert_with(|| method.name.to_string());
            return self;
        }

        let name = Arc::clone(&method.name);
        let params_codec = Arc::clone(&method.params);
        let result_codec = Arc::clone(&method.result);

        let erased = move |raw: &Value| -> Result<BoxFuture<Reply>, CodecError> {
            let params = params_codec.decode(raw)?;
            let pending = handler(params);
            let name = Arc::clone(&name);
            let result_codec = Arc::clone(&result_codec);

            Ok(Box::pin(async move {
                match pending.await {
                    Reply::Success(result) => match result_codec.encode(&result) {
                        Ok(value) => Reply::Success(value),
                        Err(err) => {
                            error!("Failed to encode result of {}: {}", name, err);
                            Reply::Error(ErrorObject::internal_error(format!(
                                "failed to encode result: {}",
                                err
                            )))
                        }
                    },
                    Reply::Error(error) => Reply::Error(error),
                    Reply::Silent => Reply::Silent,
                }
            }) as BoxFuture<Reply>)
        };

        self.handlers.insert(method.name.to_string(), Box::new(erased));
        self
    }

    /// Policy for methods outside the registry. Defaults to "Method not found".
    pub fn on_unknown_method(
        mut self,
        fallback: impl Fn(&Request) -> Reply + Send + Sync + 'static,
    ) -> Self {
        self.unknown_method = Box::new(fallback);
        self
    }

    /// Policy for params the codec rejects. Defaults to "Invalid params".
    pub fn on_invalid_params(
        mut self,
        fallback: impl Fn(&Request, CodecError) -> Reply + Send + Sync + 'static,
    ) -> Self {
        self.invalid_params = Box::new(fallback);
        self
    }

    /// Every registered method needs a handler.
    pub fn build(self) -> Result<RequestDispatcher, RegistryError> {
        if let Some(name) = self.foreign {
            return Err(RegistryError::ForeignMethod(name));
        }
        if let Some(name) = self.registry.vocab.missing_handler(&self.handlers) {
            return Err(RegistryError::MissingHandler(name.to_string()));
        }

        Ok(RequestDispatcher {
            handlers: self.handlers,
            unknown_method: self.unknown_method,
            invalid_params: self.invalid_params,
        })
    }
}

/// Request handler slot implementation for one registry
pub struct RequestDispatcher {
    handlers: HashMap<String, ErasedRequestHandler>,
    unknown_method: UnknownRequestFallback,
    invalid_params: InvalidRequestFallback,
}

#[async_trait]
impl RequestHandler for RequestDispatcher {
    async fn handle_request(&self, request: Request) -> Reply {
        let handler = match self.handlers.get(&request.method) {
            Some(handler) => handler,
            None => {
                debug!("Unknown request method: {}", request.method);
                return (self.unknown_method)(&request);
            }
        };

        let raw = request.params.clone().unwrap_or(Value::Null);
        match handler(&raw) {
            Ok(pending) => pending.await,
            Err(err) => {
                debug!("Invalid params for {}: {}", request.method, err);
                (self.invalid_params)(&request, err)
            }
        }
    }
}

/// Typed caller for the methods of one request registry
#[derive(Clone)]
pub struct RequestClient {
    registry: RequestRegistry,
    sender: Arc<dyn JsonRpcSender>,
    default_timeout_ms: Option<u64>,
}

impl RequestClient {
    pub fn new(registry: &RequestRegistry, sender: Arc<dyn JsonRpcSender>) -> Self {
        Self {
            registry: registry.clone(),
            sender,
            default_timeout_ms: None,
        }
    }

    /// Timeout applied by [`call`](Self::call)
    pub fn with_default_timeout(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = Some(timeout_ms);
        self
    }

    pub async fn call<P: 'static, R: 'static>(
        &self,
        method: &RequestMethod<P, R>,
        params: P,
    ) -> Result<R, CallError> {
        self.call_with_timeout(method, params, self.default_timeout_ms)
            .await
    }

    pub async fn call_with_timeout<P: 'static, R: 'static>(
        &self,
        method: &RequestMethod<P, R>,
        params: P,
        timeout_ms: Option<u64>,
    ) -> Result<R, CallError> {
        if method.registry != self.registry.vocab.id {
            return Err(CallError::UnknownMethod(method.name.to_string()));
        }

        let params = encode_params(method.params.as_ref(), &params)?;
        let raw = self
            .sender
            .send_request(&method.name, params, timeout_ms)
            .await?;

        method.result.decode(&raw).map_err(|err| {
            warn!("Failed to decode result of {}: {}", method.name, err);
            CallError::DecodeResult(err)
        })
    }
}

// ---------------------------------------------------------------------------
// 通知
// ---------------------------------------------------------------------------

/// Typed key for a registered notification method
pub struct NotificationMethod<P> {
    name: Arc<str>,
    registry: u64,
    params: Arc<dyn Codec<P>>,
}

impl<P> NotificationMethod<P> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<P> Clone for NotificationMethod<P> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            registry: self.registry,
            params: Arc::clone(&self.params),
        }
    }
}

impl<P> fmt::Debug for NotificationMethod<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationMethod")
            .field("name", &self.name)
            .finish()
    }
}

/// Immutable set of notification methods
#[derive(Debug, Clone)]
pub struct NotificationRegistry {
    vocab: Vocab,
}

#[derive(Debug)]
pub struct NotificationRegistryBuilder {
    vocab: VocabBuilder,
}

impl NotificationRegistry {
    pub fn builder() -> NotificationRegistryBuilder {
        NotificationRegistryBuilder {
            vocab: VocabBuilder::new(),
        }
    }

    pub fn contains(&self, method: &str) -> bool {
        self.vocab.names.contains(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.vocab.names.iter().map(String::as_str)
    }

    pub fn server(&self) -> NotificationServer {
        NotificationServer::new(self.clone())
    }

    pub fn client(&self, sender: Arc<dyn JsonRpcSender>) -> NotificationClient {
        NotificationClient::new(self, sender)
    }
}

impl NotificationRegistryBuilder {
    pub fn register<P: 'static>(
        &mut self,
        name: &str,
        params: impl Codec<P>,
    ) -> Result<NotificationMethod<P>, RegistryError> {
        Ok(NotificationMethod {
            name: self.vocab.add(name)?,
            registry: self.vocab.id,
            params: Arc::new(params),
        })
    }

    pub fn register_json<P>(&mut self, name: &str) -> Result<NotificationMethod<P>, RegistryError>
    where
        P: Serialize + DeserializeOwned + 'static,
    {
        self.register(name, JsonCodec::<P>::new())
    }

    pub fn build(self) -> NotificationRegistry {
        NotificationRegistry {
            vocab: self.vocab.build(),
        }
    }
}

type ErasedNotificationHandler = Box<dyn Fn(&Value) -> Result<(), CodecError> + Send + Sync>;
type UnknownNotificationFallback = Box<dyn Fn(&Notification) + Send + Sync>;
type InvalidNotificationFallback = Box<dyn Fn(&Notification, CodecError) + Send + Sync>;

/// Builder for the dispatcher serving one notification registry
pub struct NotificationServer {
    registry: NotificationRegistry,
    handlers: HashMap<String, ErasedNotificationHandler>,
    unknown_method: UnknownNotificationFallback,
    invalid_params: InvalidNotificationFallback,
    foreign: Option<String>,
}

impl NotificationServer {
    fn new(registry: NotificationRegistry) -> Self {
        Self {
            registry,
            handlers: HashMap::new(),
            unknown_method: Box::new(|notification: &Notification| {
                warn!("Ignoring unknown notification: {}", notification.method);
            }),
            invalid_params: Box::new(|notification: &Notification, err: CodecError| {
                warn!(
                    "Ignoring notification {} with invalid params: {}",
                    notification.method, err
                );
            }),
            foreign: None,
        }
    }

    pub fn handle<P, F>(mut self, method: &NotificationMethod<P>, handler: F) -> Self
    where
        P: 'static,
        F: Fn(P) + Send + Sync + 'static,
    {
        if method.registry != self.registry.vocab.id {
            self.foreign.get_or_insert_with(|| method.name.to_string());
            return self;
        }

        let params_codec = Arc::clone(&method.params);
        let erased = move |raw: &Value| -> Result<(), CodecError> {
            handler(params_codec.decode(raw)?);
            Ok(())
        };

        self.handlers.insert(method.name.to_string(), Box::new(erased));
        self
    }

    /// Policy for methods outside the registry. Defaults to logging.
    pub fn on_unknown_method(
        mut self,
        fallback: impl Fn(&Notification) + Send + Sync + 'static,
    ) -> Self {
        self.unknown_method = Box::new(fallback);
        self
    }

    /// Policy for params the codec rejects. Defaults to logging.
    pub fn on_invalid_params(
        mut self,
        fallback: impl Fn(&Notification, CodecError) + Send + Sync + 'static,
    ) -> Self {
        self.invalid_params = Box::new(fallback);
        self
    }

    pub fn build(self) -> Result<NotificationDispatcher, RegistryError> {
        if let Some(name) = self.foreign {
            return Err(RegistryError::ForeignMethod(name));
        }
        if let Some(name) = self.registry.vocab.missing_handler(&self.handlers) {
            return Err(RegistryError::MissingHandler(name.to_string()));
        }

        Ok(NotificationDispatcher {
            handlers: self.handlers,
            unknown_method: self.unknown_method,
            invalid_params: self.invalid_params,
        })
    }
}

/// Notification handler slot implementation for one registry
pub struct NotificationDispatcher {
    handlers: HashMap<String, ErasedNotificationHandler>,
    unknown_method: UnknownNotificationFallback,
    invalid_params: InvalidNotificationFallback,
}

impl NotificationHandler for NotificationDispatcher {
    fn handle_notification(&self, notification: Notification) {
        let handler = match self.handlers.get(&notification.method) {
            Some(handler) => handler,
            None => return (self.unknown_method)(&notification),
        };

        let raw = notification.params.clone().unwrap_or(Value::Null);
        if let Err(err) = handler(&raw) {
            (self.invalid_params)(&notification, err);
        }
    }
}

/// Typed sender for the methods of one notification registry
#[derive(Clone)]
pub struct NotificationClient {
    registry: NotificationRegistry,
    sender: Arc<dyn JsonRpcSender>,
}

impl NotificationClient {
    pub fn new(registry: &NotificationRegistry, sender: Arc<dyn JsonRpcSender>) -> Self {
        Self {
            registry: registry.clone(),
            sender,
        }
    }

    pub fn notify<P: 'static>(&self, method: &NotificationMethod<P>, params: P) -> Result<(), CallError> {
        if method.registry != self.registry.vocab.id {
            return Err(CallError::UnknownMethod(method.name.to_string()));
        }

        let params = encode_params(method.params.as_ref(), &params)?;
        self.sender.send_notification(&method.name, params)?;
        Ok(())
    }
}
