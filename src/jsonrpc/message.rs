use serde::Serialize;
use serde_json::Value;

use super::types::{ErrorObject, Id, Version};

/// A call that expects a response correlated by `id`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub jsonrpc: Version,
    pub id: Id,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A one-way call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub jsonrpc: Version,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuccessResponse {
    pub jsonrpc: Version,
    pub id: Id,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorResponse {
    pub jsonrpc: Version,
    pub id: Id,
    pub error: ErrorObject,
}

/// A single JSON-RPC 2.0 message, exactly one of the four wire shapes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Success(SuccessResponse),
    Error(ErrorResponse),
}

impl Request {
    pub fn new(id: Id, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Version,
            id,
            method: method.into(),
            params,
        }
    }
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Version,
            method: method.into(),
            params,
        }
    }
}

impl SuccessResponse {
    pub fn new(id: Id, result: Value) -> Self {
        Self {
            jsonrpc: Version,
            id,
            result,
        }
    }
}

impl ErrorResponse {
    pub fn new(id: Id, error: ErrorObject) -> Self {
        Self {
            jsonrpc: Version,
            id,
            error,
        }
    }
}

impl Message {
    /// Method name for requests and notifications
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(request) => Some(&request.method),
            Message::Notification(notification) => Some(&notification.method),
            Message::Success(_) | Message::Error(_) => None,
        }
    }

    pub fn id(&self) -> Option<&Id> {
        match self {
            Message::Request(request) => Some(&request.id),
            Message::Notification(_) => None,
            Message::Success(response) => Some(&response.id),
            Message::Error(response) => Some(&response.id),
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Notification> for Message {
    fn from(notification: Notification) -> Self {
        Message::Notification(notification)
    }
}

impl From<SuccessResponse> for Message {
    fn from(response: SuccessResponse) -> Self {
        Message::Success(response)
    }
}

impl From<ErrorResponse> for Message {
    fn from(response: ErrorResponse) -> Self {
        Message::Error(response)
    }
}
