//! JSON-RPC 2.0 message types and the wire codec.
//!
//! Every message travels as one flat JSON object with the keys `jsonrpc`,
//! `id`, `method`, `params`, `result` and `error`. Presence decides the
//! kind: a method means a request (a call when an id is also present, a
//! notification otherwise); an id without a method means a response.
//! `params` and `result` are carried end-to-end as raw JSON and decoded
//! only by whoever consumes them.

use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::value::RawValue;

use crate::error::{raw_eq, Error, ErrorObject};

/// The only accepted value of the `jsonrpc` field.
pub const VERSION: &str = "2.0";

/// A request identifier: an integer, a string, or the invalid default.
///
/// The default identifier marshals as JSON null. Numbers received with a
/// fractional part are coerced to their integer truncation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum RequestId {
    /// The invalid, default-constructed identifier.
    #[default]
    Null,
    /// Integer identifier.
    Number(i64),
    /// String identifier.
    String(String),
}

impl RequestId {
    /// Create an integer identifier.
    pub fn number(value: i64) -> Self {
        RequestId::Number(value)
    }

    /// Create a string identifier.
    pub fn string(value: impl Into<String>) -> Self {
        RequestId::String(value.into())
    }

    /// Whether the identifier carries a value.
    pub fn is_valid(&self) -> bool {
        !matches!(self, RequestId::Null)
    }

    /// The integer slot, if populated.
    pub fn as_number(&self) -> Option<i64> {
        match self {
            RequestId::Number(value) => Some(*value),
            _ => None,
        }
    }

    /// The string slot, if populated.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RequestId::String(value) => Some(value),
            _ => None,
        }
    }

    /// Unambiguous formatting: strings are quoted, integers are preceded
    /// by `#`. The plain form is the `Display` implementation.
    pub fn quoted(&self) -> QuotedId<'_> {
        QuotedId(self)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Null => write!(f, "null"),
            RequestId::Number(value) => write!(f, "{value}"),
            RequestId::String(value) => write!(f, "{value}"),
        }
    }
}

/// See [`RequestId::quoted`].
pub struct QuotedId<'a>(&'a RequestId);

impl fmt::Display for QuotedId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            RequestId::Null => write!(f, "null"),
            RequestId::Number(value) => write!(f, "#{value}"),
            RequestId::String(value) => write!(f, "{value:?}"),
        }
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RequestId::Null => serializer.serialize_unit(),
            RequestId::Number(value) => serializer.serialize_i64(*value),
            RequestId::String(value) => serializer.serialize_str(value),
        }
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl<'de> de::Visitor<'de> for IdVisitor {
            type Value = RequestId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an integer, a string, or null")
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<RequestId, E> {
                Ok(RequestId::Number(value))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<RequestId, E> {
                i64::try_from(value)
                    .map(RequestId::Number)
                    .map_err(|_| E::custom("request id out of range"))
            }

            fn visit_f64<E: de::Error>(self, value: f64) -> Result<RequestId, E> {
                // fractional ids are coerced to their integer truncation
                Ok(RequestId::Number(value as i64))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<RequestId, E> {
                Ok(RequestId::String(value.to_string()))
            }

            fn visit_unit<E: de::Error>(self) -> Result<RequestId, E> {
                Ok(RequestId::Null)
            }
        }

        deserializer.deserialize_any(IdVisitor)
    }
}

/// A call or notification.
///
/// A request without an identifier is a notification and expects no reply;
/// with an identifier it is a call and a response is required.
#[derive(Debug, Clone)]
pub struct Request {
    /// The identifier, absent for notifications.
    pub id: Option<RequestId>,
    /// The method name to invoke.
    pub method: String,
    /// The raw parameter blob, if any.
    pub params: Option<Box<RawValue>>,
}

impl Request {
    /// Create a call.
    pub fn call(id: RequestId, method: impl Into<String>, params: Option<Box<RawValue>>) -> Self {
        Self {
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// Create a notification.
    pub fn notification(method: impl Into<String>, params: Option<Box<RawValue>>) -> Self {
        Self {
            id: None,
            method: method.into(),
            params,
        }
    }

    /// Whether this request expects a response. An invalid identifier
    /// counts as no identifier at all.
    pub fn is_call(&self) -> bool {
        self.id.as_ref().is_some_and(RequestId::is_valid)
    }

    /// Decode the params into a caller-supplied type.
    ///
    /// Absent params decode as JSON null, so methods that take no
    /// arguments can ask for `()` or `Option<T>`.
    pub fn decode_params<T: serde::de::DeserializeOwned>(&self) -> Result<T, Error> {
        let raw = self.params.as_deref().map(RawValue::get).unwrap_or("null");
        serde_json::from_str(raw).map_err(|e| Error::InvalidParams(e.to_string()))
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.method == other.method
            && raw_eq(self.params.as_deref(), other.params.as_deref())
    }
}

/// A reply to a call, carrying the identifier of the originating request
/// and exactly one of a result or an error.
#[derive(Debug, Clone)]
pub struct Response {
    /// The identifier of the call this responds to.
    pub id: RequestId,
    /// The outcome: a raw result blob, or a structured error.
    pub result: Result<Box<RawValue>, ErrorObject>,
}

impl Response {
    /// Create a success response.
    pub fn success(id: RequestId, result: Box<RawValue>) -> Self {
        Self {
            id,
            result: Ok(result),
        }
    }

    /// Create an error response.
    pub fn failure(id: RequestId, error: ErrorObject) -> Self {
        Self {
            id,
            result: Err(error),
        }
    }
}

impl PartialEq for Response {
    fn eq(&self, other: &Self) -> bool {
        if self.id != other.id {
            return false;
        }
        match (&self.result, &other.result) {
            (Ok(a), Ok(b)) => a.get() == b.get(),
            (Err(a), Err(b)) => a == b,
            _ => false,
        }
    }
}

/// The closed set of wire messages.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A call or notification.
    Request(Request),
    /// A reply to a call.
    Response(Response),
}

/// The flat wire object, used for both directions of the codec.
#[derive(Serialize)]
struct EnvelopeRef<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a RawValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a RawValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a ErrorObject>,
}

#[derive(Deserialize)]
struct Envelope {
    jsonrpc: Option<String>,
    #[serde(default, deserialize_with = "id_present")]
    id: Option<RequestId>,
    method: Option<String>,
    #[serde(default, deserialize_with = "raw_present")]
    params: Option<Box<RawValue>>,
    #[serde(default, deserialize_with = "raw_present")]
    result: Option<Box<RawValue>>,
    error: Option<ErrorObject>,
}

/// Capture a field as present even when its value is JSON null, which
/// `Option<RawValue>` alone would fold into "absent".
pub(crate) fn raw_present<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Box<RawValue>>, D::Error> {
    Box::<RawValue>::deserialize(deserializer).map(Some)
}

fn id_present<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<RequestId>, D::Error> {
    RequestId::deserialize(deserializer).map(Some)
}

impl Message {
    /// Encode the message as a single JSON object.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let envelope = match self {
            Message::Request(request) => EnvelopeRef {
                jsonrpc: VERSION,
                id: request.id.as_ref(),
                method: Some(&request.method),
                params: request.params.as_deref(),
                result: None,
                error: None,
            },
            Message::Response(response) => EnvelopeRef {
                jsonrpc: VERSION,
                id: Some(&response.id),
                method: None,
                params: None,
                result: response.result.as_deref().ok(),
                error: response.result.as_ref().err(),
            },
        };
        serde_json::to_vec(&envelope)
            .map_err(|e| Error::Internal(format!("failed to encode message: {e}")))
    }

    /// Decode a single JSON object and classify it.
    pub fn decode(data: &[u8]) -> Result<Message, Error> {
        let envelope: Envelope =
            serde_json::from_slice(data).map_err(|e| Error::Parse(e.to_string()))?;

        match envelope.jsonrpc.as_deref() {
            Some(VERSION) => {}
            Some(other) => return Err(Error::Version(other.to_string())),
            None => return Err(Error::Version("missing".to_string())),
        }

        let method = envelope.method.unwrap_or_default();
        if !method.is_empty() {
            // an explicit null id means the same as an absent one
            return Ok(Message::Request(Request {
                id: envelope.id.filter(RequestId::is_valid),
                method,
                params: envelope.params,
            }));
        }

        let Some(id) = envelope.id else {
            return Err(Error::InvalidRequest(
                "message is neither a request nor a response".to_string(),
            ));
        };
        let result = match (envelope.error, envelope.result) {
            (Some(error), _) => Err(error),
            (None, Some(result)) => Ok(result),
            (None, None) => {
                return Err(Error::InvalidRequest(
                    "response carries neither result nor error".to_string(),
                ))
            }
        };
        Ok(Message::Response(Response { id, result }))
    }
}

/// Encode any serializable value as a raw JSON blob.
pub fn raw_json<T: Serialize + ?Sized>(value: &T) -> Result<Box<RawValue>, Error> {
    serde_json::value::to_raw_value(value)
        .map_err(|e| Error::Internal(format!("failed to encode value: {e}")))
}
