//! Request Builder. Spec §4.2.

use bytes::Bytes;
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorResponse;
use crate::location::Location;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormEncType {
    UrlEncoded,
    Multipart,
}

impl FormEncType {
    pub fn content_type(&self) -> &'static str {
        match self {
            FormEncType::UrlEncoded => "application/x-www-form-urlencoded",
            FormEncType::Multipart => "multipart/form-data",
        }
    }
}

#[derive(Debug, Clone)]
pub enum FormValue {
    Text(String),
    Blob { filename: String, content_type: String, bytes: Bytes },
}

impl FormValue {
    pub fn is_binary(&self) -> bool {
        matches!(self, FormValue::Blob { .. })
    }
}

/// An HTML-form-like bag of fields. Multiple values per name are allowed,
/// matching `FormData`/`URLSearchParams` semantics.
#[derive(Debug, Clone, Default)]
pub struct FormData(pub IndexMap<String, Vec<FormValue>>);

impl FormData {
    pub fn new() -> Self {
        FormData(IndexMap::new())
    }

    pub fn append(&mut self, name: impl Into<String>, value: FormValue) {
        self.0.entry(name.into()).or_default().push(value);
    }

    pub fn has_binary_field(&self) -> bool {
        self.0.values().any(|vs| vs.iter().any(FormValue::is_binary))
    }

    /// Serializes text fields as a URL query string (`?a=1&b=2`), used when
    /// a GET submission folds its form data into the URL (spec §3).
    pub fn to_query_string(&self) -> String {
        let mut pairs = Vec::new();
        for (name, values) in &self.0 {
            for v in values {
                if let FormValue::Text(s) = v {
                    pairs.push(format!(
                        "{}={}",
                        percent_encoding::utf8_percent_encode(name, percent_encoding::NON_ALPHANUMERIC),
                        percent_encoding::utf8_percent_encode(s, percent_encoding::NON_ALPHANUMERIC),
                    ));
                }
            }
        }
        if pairs.is_empty() {
            String::new()
        } else {
            format!("?{}", pairs.join("&"))
        }
    }

    /// Renders `application/x-www-form-urlencoded` bytes for a POST body.
    pub fn to_urlencoded_bytes(&self) -> Vec<u8> {
        self.to_query_string().trim_start_matches('?').as_bytes().to_vec()
    }
}

/// A caller-declared submission intent, before it has been bound to a
/// matched route. Spec §3 ("Navigation::submitting") and §6 ("Submission
/// opts").
#[derive(Debug, Clone)]
pub struct Submission {
    pub method: http::Method,
    pub enc_type: FormEncType,
    pub form_data: FormData,
}

impl Submission {
    pub fn is_get(&self) -> bool {
        self.method == http::Method::GET
    }
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Form { enc_type: FormEncType, data: FormData },
}

/// The request-like object handed to a loader/action call. Spec §4.2.
#[derive(Clone)]
pub struct RouterRequest {
    pub method: http::Method,
    pub url: String,
    pub headers: http::HeaderMap,
    pub body: RequestBody,
    pub signal: CancellationToken,
}

impl RouterRequest {
    pub fn is_aborted(&self) -> bool {
        self.signal.is_cancelled()
    }
}

/// Builds the request for a loader call (always effectively GET).
pub fn build_loader_request(location: &Location, signal: CancellationToken) -> RouterRequest {
    let mut headers = http::HeaderMap::new();
    headers.insert(http::header::ACCEPT, http::HeaderValue::from_static("*/*"));
    RouterRequest {
        method: http::Method::GET,
        url: location.href(),
        headers,
        body: RequestBody::Empty,
        signal,
    }
}

/// Folds a GET submission's form data into `href`'s query, replacing
/// whatever query string `href` already carried. Binary fields can't ride
/// a GET URL (spec §4.2), so this is also where that 400 originates.
pub fn serialize_get_href(href: &str, form_data: &FormData) -> Result<String, ErrorResponse> {
    if form_data.has_binary_field() {
        return Err(ErrorResponse::binary_in_get());
    }
    Ok(format!("{}{}", strip_query(href), form_data.to_query_string()))
}

/// Builds the request for a submission. GET submissions with a binary
/// field fail synchronously per spec §4.2 with a 400 keyed at the nearest
/// boundary above the targeted route — the caller passes that boundary id
/// in when constructing the resulting error.
pub fn build_submission_request(
    href: &str,
    submission: &Submission,
    signal: CancellationToken,
) -> Result<RouterRequest, ErrorResponse> {
    let mut headers = http::HeaderMap::new();

    if submission.is_get() {
        let url = serialize_get_href(href, &submission.form_data)?;
        return Ok(RouterRequest {
            method: http::Method::GET,
            url,
            headers,
            body: RequestBody::Empty,
            signal,
        });
    }

    let content_type = submission.enc_type.content_type();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_str(content_type).unwrap(),
    );

    Ok(RouterRequest {
        method: submission.method.clone(),
        url: href.to_string(),
        headers,
        body: RequestBody::Form { enc_type: submission.enc_type, data: submission.form_data.clone() },
        signal,
    })
}

fn strip_query(href: &str) -> &str {
    match href.find(['?', '#']) {
        Some(i) => &href[..i],
        None => href,
    }
}

/// Infers the enc type the way a plain HTML `<form>` would: multipart iff
/// any field is a binary blob, url-encoded otherwise.
pub fn infer_enc_type(form_data: &FormData) -> FormEncType {
    if form_data.has_binary_field() {
        FormEncType::Multipart
    } else {
        FormEncType::UrlEncoded
    }
}
