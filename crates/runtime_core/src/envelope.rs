//! The `x-wt-params` envelope: per-request directives carried out of band as
//! base64-encoded JSON.

use std::collections::BTreeMap;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::token::{TokenClaims, TokenError, TokenSigner};

pub const ENVELOPE_HEADER: &str = "x-wt-params";
pub const MERGE_BODY_QUERY: &str = "webtask_mb";
pub const PARSE_BODY_QUERY: &str = "webtask_pb";
pub const RESERVED_QUERY_PREFIX: &str = "webtask_";
pub const DEFAULT_CONTAINER: &str = "webtask-local";

// Callers in the wild send both padded and unpadded values.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("header is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("header is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported parse body mode {0}")]
    ParseBodyMode(u64),

    #[error("failed to sign auth token: {0}")]
    Token(#[from] TokenError),
}

/// When the request body is read and parsed before the handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseBody {
    Never,
    Always,
    /// Parse only for the completion-based calling conventions.
    #[default]
    OnArity,
}

impl ParseBody {
    pub fn from_wire(value: u64) -> Result<Self, EnvelopeError> {
        match value {
            0 => Ok(Self::Never),
            1 => Ok(Self::Always),
            2 => Ok(Self::OnArity),
            other => Err(EnvelopeError::ParseBodyMode(other)),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Never => 0,
            Self::Always => 1,
            Self::OnArity => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UrlFormat {
    #[default]
    Unspecified,
    Path,
    Subdomain,
    CustomDomain,
    /// Values above 3 are carried through untouched.
    Other(u8),
}

impl From<u8> for UrlFormat {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Unspecified,
            1 => Self::Path,
            2 => Self::Subdomain,
            3 => Self::CustomDomain,
            other => Self::Other(other),
        }
    }
}

impl From<UrlFormat> for u8 {
    fn from(value: UrlFormat) -> Self {
        match value {
            UrlFormat::Unspecified => 0,
            UrlFormat::Path => 1,
            UrlFormat::Subdomain => 2,
            UrlFormat::CustomDomain => 3,
            UrlFormat::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParamEnvelope {
    pub merge_body: bool,
    pub parse_body: ParseBody,
    pub request_id: Option<String>,
    pub params: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
    pub meta: BTreeMap<String, String>,
    pub container: Option<String>,
    pub auth_token: Option<String>,
    pub url_format: UrlFormat,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(default, deserialize_with = "lenient_flag", serialize_with = "flag_as_int")]
    mb: bool,
    #[serde(default, deserialize_with = "lenient_mode")]
    pb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    req_id: Option<String>,
    #[serde(default, deserialize_with = "nullable_map")]
    pctx: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "nullable_map")]
    ectx: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "nullable_map")]
    meta: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    container: Option<String>,
    #[serde(default)]
    url_format: Option<u8>,
}

impl ParamEnvelope {
    /// Decodes the header value. A missing or empty header yields the defaults.
    pub fn decode(header: Option<&str>) -> Result<Self, EnvelopeError> {
        let raw = match header.map(str::trim) {
            Some(raw) if !raw.is_empty() => raw,
            _ => return Ok(Self::default()),
        };
        let bytes = LENIENT_BASE64.decode(raw)?;
        let wire: WireEnvelope = serde_json::from_slice(&bytes)?;
        Self::from_wire(wire)
    }

    fn from_wire(wire: WireEnvelope) -> Result<Self, EnvelopeError> {
        let parse_body = match wire.pb {
            Some(mode) => ParseBody::from_wire(mode)?,
            None => ParseBody::default(),
        };
        Ok(Self {
            merge_body: wire.mb,
            parse_body,
            request_id: wire.req_id,
            params: wire.pctx,
            secrets: wire.ectx,
            meta: wire.meta,
            container: wire.container,
            auth_token: wire.token,
            url_format: wire.url_format.map(UrlFormat::from).unwrap_or_default(),
        })
    }

    fn to_wire(&self) -> WireEnvelope {
        WireEnvelope {
            mb: self.merge_body,
            pb: Some(u64::from(self.parse_body.to_wire())),
            req_id: self.request_id.clone(),
            pctx: self.params.clone(),
            ectx: self.secrets.clone(),
            meta: self.meta.clone(),
            token: self.auth_token.clone(),
            container: self.container.clone(),
            url_format: Some(self.url_format.into()),
        }
    }

    /// Inverse of [`ParamEnvelope::decode`].
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        let json = serde_json::to_vec(&self.to_wire())?;
        Ok(STANDARD.encode(json))
    }

    /// Encodes the envelope, signing a development token first when the
    /// envelope does not carry one.
    pub fn encode_signed(&self, signer: &dyn TokenSigner) -> Result<String, EnvelopeError> {
        if self.auth_token.is_some() {
            return self.encode();
        }
        let container = self.container.as_deref().unwrap_or(DEFAULT_CONTAINER);
        let token = signer.sign(&TokenClaims::for_container(container))?;
        let mut signed = self.clone();
        signed.auth_token = Some(token);
        signed.encode()
    }

    /// Reserved query parameters force body handling on for callers that
    /// cannot set headers.
    pub fn apply_query_overrides(&mut self, query: &BTreeMap<String, String>) {
        if query
            .get(MERGE_BODY_QUERY)
            .is_some_and(|value| !value.is_empty())
        {
            self.merge_body = true;
        }
        if query
            .get(PARSE_BODY_QUERY)
            .is_some_and(|value| !value.is_empty())
        {
            self.parse_body = ParseBody::Always;
        }
    }
}

/// Appends the reserved query flags the envelope asks for, so that a caller
/// without header access gets the same body handling.
pub fn prepare_url(path_and_query: &str, envelope: &ParamEnvelope) -> String {
    let mut flags = Vec::new();
    if envelope.merge_body {
        flags.push((MERGE_BODY_QUERY, "1"));
    }
    if envelope.parse_body == ParseBody::Always {
        flags.push((PARSE_BODY_QUERY, "1"));
    }
    append_query(path_and_query, flags)
}

pub fn append_query<'a, I>(path_and_query: &str, pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    let mut appended = false;
    for (key, value) in pairs {
        serializer.append_pair(key, value);
        appended = true;
    }
    if !appended {
        return path_and_query.to_string();
    }
    let encoded = serializer.finish();
    let separator = match path_and_query.find('?') {
        None => "?",
        Some(_) if path_and_query.ends_with('?') || path_and_query.ends_with('&') => "",
        Some(_) => "&",
    };
    format!("{}{}{}", path_and_query, separator, encoded)
}

pub fn is_reserved_query_key(key: &str) -> bool {
    key.starts_with(RESERVED_QUERY_PREFIX)
}

// `mb` goes out as 0/1 to match the documented wire format.
fn flag_as_int<S>(flag: &bool, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u8(u8::from(*flag))
}

fn lenient_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(false),
        serde_json::Value::Bool(flag) => Ok(flag),
        serde_json::Value::Number(number) => Ok(number.as_f64().is_some_and(|n| n != 0.0)),
        serde_json::Value::String(text) => Ok(!text.is_empty() && text != "0"),
        other => Err(de::Error::custom(format!("expected a flag, got {}", other))),
    }
}

fn lenient_mode<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Bool(flag) => Ok(Some(u64::from(flag))),
        serde_json::Value::Number(number) => number
            .as_u64()
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("invalid parse body mode {}", number))),
        other => Err(de::Error::custom(format!(
            "expected a parse body mode, got {}",
            other
        ))),
    }
}

fn nullable_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BTreeMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}
