use crate::error::{AppError, Result};
use axum::http::header::CONTENT_TYPE;
use axum::http::request::Parts;
use axum::http::HeaderName;
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

/// Default lookup used when none is configured.
pub const DEFAULT_KEY_LOOKUP: &str = "header:X-Idempotency-Key";

/// Strategy for pulling an idempotency key out of a request.
///
/// `Ok(None)` means the request carries no key and is passed through untouched.
pub trait KeyExtractor: Send + Sync {
    fn extract(&self, parts: &Parts, body: &Bytes) -> Result<Option<String>>;

    /// Whether the request body must be buffered before calling `extract`.
    fn needs_body(&self) -> bool {
        false
    }
}

impl<F> KeyExtractor for F
where
    F: Fn(&Parts) -> Result<Option<String>> + Send + Sync,
{
    fn extract(&self, parts: &Parts, _body: &Bytes) -> Result<Option<String>> {
        self(parts)
    }
}

/// Built-in lookups, parsed from `header:<name>`, `query:<name>` or `form:<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyLookup {
    Header(HeaderName),
    Query(String),
    Form(String),
}

impl KeyLookup {
    pub fn parse(lookup: &str) -> Result<Self> {
        let (source, name) = lookup.split_once(':').ok_or_else(|| {
            AppError::Config(format!("key lookup `{}` is not in the form <source>:<name>", lookup))
        })?;

        if name.is_empty() {
            return Err(AppError::Config(format!("key lookup `{}` has no name", lookup)));
        }

        match source {
            "header" => HeaderName::from_bytes(name.as_bytes())
                .map(KeyLookup::Header)
                .map_err(|_| AppError::Config(format!("invalid header name `{}`", name))),
            "query" => Ok(KeyLookup::Query(name.to_string())),
            "form" => Ok(KeyLookup::Form(name.to_string())),
            other => Err(AppError::Config(format!("unknown key lookup `{}`", other))),
        }
    }
}

impl FromStr for KeyLookup {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for KeyLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyLookup::Header(name) => write!(f, "header:{}", name),
            KeyLookup::Query(name) => write!(f, "query:{}", name),
            KeyLookup::Form(name) => write!(f, "form:{}", name),
        }
    }
}

impl KeyExtractor for KeyLookup {
    fn extract(&self, parts: &Parts, body: &Bytes) -> Result<Option<String>> {
        match self {
            KeyLookup::Header(name) => key_from_header(parts, name),
            KeyLookup::Query(param) => Ok(key_from_query(parts, param)),
            KeyLookup::Form(field) => Ok(key_from_form(parts, body, field)),
        }
    }

    fn needs_body(&self) -> bool {
        matches!(self, KeyLookup::Form(_))
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn key_from_header(parts: &Parts, name: &HeaderName) -> Result<Option<String>> {
    match parts.headers.get(name) {
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| AppError::Extraction(format!("header `{}` is not valid text", name)))?;
            Ok(non_empty(value.to_string()))
        }
        None => Ok(None),
    }
}

fn first_pair(input: &[u8], name: &str) -> Option<String> {
    url::form_urlencoded::parse(input)
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

fn key_from_query(parts: &Parts, param: &str) -> Option<String> {
    let query = parts.uri.query()?;
    first_pair(query.as_bytes(), param).and_then(non_empty)
}

fn is_urlencoded_form(parts: &Parts) -> bool {
    parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

/// Form body fields win over query parameters of the same name.
fn key_from_form(parts: &Parts, body: &Bytes, field: &str) -> Option<String> {
    if is_urlencoded_form(parts) {
        if let Some(key) = first_pair(body, field).and_then(non_empty) {
            return Some(key);
        }
    }
    key_from_query(parts, field)
}
