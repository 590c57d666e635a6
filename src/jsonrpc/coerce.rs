//! Inbound validation of decoded JSON values.
//!
//! A value is first split into [`RawFields`], then run through a fixed
//! sequence of checks. The order of the checks decides which error a
//! malformed value produces, so it must not be rearranged.

use serde_json::{Map, Value};

use super::error::CoerceError;
use super::message::{ErrorResponse, Message, Notification, Request, SuccessResponse};
use super::types::{ErrorObject, Id, Version};

const MESSAGE_FIELDS: [&str; 6] = ["jsonrpc", "id", "method", "params", "result", "error"];

/// Top-level fields of a message. `None` means absent; a present JSON null
/// is `Some(Value::Null)`.
#[derive(Debug, Default)]
struct RawFields<'a> {
    jsonrpc: Option<&'a Value>,
    id: Option<&'a Value>,
    method: Option<&'a Value>,
    params: Option<&'a Value>,
    result: Option<&'a Value>,
    error: Option<&'a Value>,
}

impl<'a> RawFields<'a> {
    fn split(value: &'a Value) -> Result<Self, CoerceError> {
        let object = value.as_object().ok_or(CoerceError::NotAnObject)?;

        if let Some(key) = object
            .keys()
            .find(|key| !MESSAGE_FIELDS.contains(&key.as_str()))
        {
            return Err(CoerceError::UnexpectedField(key.clone()));
        }

        Ok(Self {
            jsonrpc: object.get("jsonrpc"),
            id: object.get("id"),
            method: object.get("method"),
            params: object.get("params"),
            result: object.get("result"),
            error: object.get("error"),
        })
    }
}

/// Validate a decoded value and classify it as exactly one message kind.
pub fn coerce(value: &Value) -> Result<Message, CoerceError> {
    let fields = RawFields::split(value)?;

    if fields.jsonrpc.and_then(Value::as_str) != Some(Version::STR) {
        return Err(CoerceError::InvalidVersion);
    }

    // 外側のOption: キーの有無、内側のOption: JSONのnull
    let id = fields.id.map(wire_id).transpose()?;

    match (id, fields.method) {
        (None, _) => notification(&fields),
        (Some(id), None) => response(id, &fields),
        (Some(id), Some(method)) => request(id, method, &fields),
    }
}

/// Validate an `error` member. Shared by inbound coercion and
/// `TryFrom<Value> for ErrorObject`.
pub fn error_object(value: &Value) -> Result<ErrorObject, CoerceError> {
    let object: &Map<String, Value> = value.as_object().ok_or(CoerceError::ErrorNotAnObject)?;

    let code = object
        .get("code")
        .and_then(Value::as_i64)
        .ok_or(CoerceError::ErrorCodeNotInteger)?;
    let message = object
        .get("message")
        .and_then(Value::as_str)
        .ok_or(CoerceError::ErrorMessageNotString)?;

    Ok(ErrorObject {
        code,
        message: message.to_string(),
        data: object.get("data").cloned(),
    })
}

// 数値IDはi64に収まり、小数部も指数部も持たないこと
fn wire_id(value: &Value) -> Result<Option<Id>, CoerceError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(Id::String(s.clone()))),
        Value::Number(n) => n
            .as_i64()
            .map(|n| Some(Id::Number(n)))
            .ok_or(CoerceError::InvalidIdType),
        _ => Err(CoerceError::InvalidIdType),
    }
}

fn method_name(value: &Value) -> Result<String, CoerceError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or(CoerceError::InvalidMethodType)
}

fn params(value: Option<&Value>) -> Result<Option<Value>, CoerceError> {
    match value {
        None => Ok(None),
        Some(params @ (Value::Array(_) | Value::Object(_))) => Ok(Some(params.clone())),
        Some(_) => Err(CoerceError::InvalidParams),
    }
}

fn notification(fields: &RawFields<'_>) -> Result<Message, CoerceError> {
    if fields.error.is_some() {
        return Err(CoerceError::ErrorWithoutId);
    }
    if fields.result.is_some() {
        return Err(CoerceError::ResultWithoutId);
    }
    let method = fields.method.ok_or(CoerceError::NoMethodInNotification)?;

    Ok(Message::Notification(Notification::new(
        method_name(method)?,
        params(fields.params)?,
    )))
}

fn response(id: Option<Id>, fields: &RawFields<'_>) -> Result<Message, CoerceError> {
    let error = fields.error.map(error_object).transpose()?;

    let message = match (error, fields.result) {
        (Some(_), Some(_)) => return Err(CoerceError::BothResultAndError),
        (None, None) => return Err(CoerceError::NoResultInResponse),
        (Some(error), None) => {
            let id = id.ok_or(CoerceError::ResponseWithoutId)?;
            Message::Error(ErrorResponse::new(id, error))
        }
        (None, Some(result)) => {
            let id = id.ok_or(CoerceError::ResponseWithoutId)?;
            Message::Success(SuccessResponse::new(id, result.clone()))
        }
    };

    if fields.params.is_some() {
        return Err(CoerceError::ParamsInResponse);
    }
    Ok(message)
}

fn request(id: Option<Id>, method: &Value, fields: &RawFields<'_>) -> Result<Message, CoerceError> {
    let id = id.ok_or(CoerceError::RequestWithNullId)?;
    if fields.result.is_some() {
        return Err(CoerceError::ResultInRequest);
    }
    if fields.error.is_some() {
        return Err(CoerceError::ErrorInRequest);
    }

    Ok(Message::Request(Request::new(
        id,
        method_name(method)?,
        params(fields.params)?,
    )))
}
