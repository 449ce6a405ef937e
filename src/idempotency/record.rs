use crate::error::{AppError, Result};
use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Namespace for record keys in the shared store.
pub const RECORD_KEY_PREFIX: &str = "req::";

/// Builds the store key for a caller-supplied idempotency key.
pub fn record_key(idempotency_key: &str) -> String {
    format!("{}{}", RECORD_KEY_PREFIX, idempotency_key)
}

/// Persisted state for one idempotency key.
///
/// A record starts out pending (`done == false`) and is rewritten exactly once by
/// the request that created it. The response fields are only meaningful once
/// `done` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub done: bool,
    #[serde(default)]
    pub response_code: u16,
    #[serde(default, deserialize_with = "null_as_default")]
    pub response_headers: BTreeMap<String, Vec<String>>,
    #[serde(default, with = "base64_body")]
    pub response_body: Vec<u8>,
}

impl IdempotencyRecord {
    /// The placeholder written at lock-acquisition time.
    pub fn pending() -> Self {
        Self::default()
    }

    /// A finished record built from a captured response. Header values that are
    /// not valid UTF-8 cannot be stored faithfully and are rejected.
    pub fn completed(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Result<Self> {
        Ok(Self {
            done: true,
            response_code: status.as_u16(),
            response_headers: headers_to_map(headers)?,
            response_body: body.to_vec(),
        })
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Rebuilds the stored response. Repeated header values are appended in the
    /// order they were captured.
    pub fn into_response(self) -> Result<Response> {
        let status = StatusCode::from_u16(self.response_code).map_err(|_| {
            AppError::InvalidRecord(format!("invalid status code {}", self.response_code))
        })?;

        let mut response = Response::new(Body::from(Bytes::from(self.response_body)));
        *response.status_mut() = status;

        let headers = response.headers_mut();
        for (name, values) in self.response_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| AppError::InvalidRecord(format!("invalid header name `{}`", name)))?;
            for value in values {
                let value = HeaderValue::from_str(&value).map_err(|_| {
                    AppError::InvalidRecord(format!("invalid value for header `{}`", name))
                })?;
                headers.append(name.clone(), value);
            }
        }

        Ok(response)
    }
}

fn headers_to_map(headers: &HeaderMap) -> Result<BTreeMap<String, Vec<String>>> {
    let mut map = BTreeMap::new();
    for name in headers.keys() {
        let values = headers
            .get_all(name)
            .iter()
            .map(|v| {
                std::str::from_utf8(v.as_bytes()).map(str::to_string).map_err(|_| {
                    AppError::InvalidRecord(format!("value of header `{}` is not valid UTF-8", name))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        map.insert(name.as_str().to_string(), values);
    }
    Ok(map)
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD.decode(encoded).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
