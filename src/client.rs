// dtctl - CLI for the Darktrace API
// Copyright (C) 2024 Mathias Uhl <mathiasuhl@gmx.de>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, HeaderValue};
use reqwest::{Certificate, Method, Url};
use serde_json::Value;
use sha1::Sha1;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

type HmacSha1 = Hmac<Sha1>;

const SIGNATURE_DATE_FORMAT: &str = "%Y%m%dT%H%M%S";
const LOGIN_PAGE_MARKER: &str = "<title>Darktrace | Login</title>";

/// Issues signed requests against the appliance. Query parameters are part of
/// the signed path, so callers pass them separately from the endpoint.
pub trait ApiQuery {
    fn get(&self, endpoint: &str, query: &[(&str, String)]) -> Result<Value>;

    /// `form` becomes the urlencoded body; `query` is only used for signing.
    fn post(&self, endpoint: &str, form: &[(&str, String)], query: &[(&str, String)])
    -> Result<Value>;

    fn delete(&self, endpoint: &str, query: &[(&str, String)]) -> Result<Value>;
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Failed to connect to {0}")]
    Connection(String),
    #[error("HTTP {status} from {endpoint}: {body}")]
    Status {
        status: u16,
        endpoint: String,
        body: String,
    },
    #[error("API endpoint not supported: {0}")]
    UnsupportedEndpoint(String),
    #[error("expected a JSON {expected} from {endpoint}")]
    UnexpectedShape {
        expected: &'static str,
        endpoint: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub cacert: Option<PathBuf>,
    pub insecure: bool,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: Url,
    http: Client,
    public_key: String,
    private_key: String,
}

impl ApiClient {
    pub fn new(base_url: &str, public_key: &str, private_key: &str, tls: &TlsOptions) -> Result<Self> {
        let parsed = Url::parse(base_url).context("parsing host address")?;
        let mut builder = Client::builder().user_agent(HeaderValue::from_static(concat!(
            "dtctl/",
            env!("CARGO_PKG_VERSION")
        )));

        match tls.cacert.as_deref() {
            Some(path) if path.exists() => {
                let pem = fs::read(path)
                    .with_context(|| format!("reading CA certificate {}", path.display()))?;
                let cert = Certificate::from_pem(&pem).context("parsing CA certificate")?;
                builder = builder.add_root_certificate(cert);
            }
            _ if tls.insecure => builder = builder.danger_accept_invalid_certs(true),
            _ => {}
        }

        let http = builder.build().context("building HTTP client")?;

        Ok(Self {
            base_url: parsed,
            http,
            public_key: public_key.to_string(),
            private_key: private_key.to_string(),
        })
    }

    /// Hex HMAC-SHA1 over `path?query`, public key and timestamp, newline separated.
    pub fn signature(&self, signed_path: &str, date: &str) -> Result<String> {
        let message = [signed_path, self.public_key.as_str(), date].join("\n");
        let mut mac = HmacSha1::new_from_slice(self.private_key.as_bytes())
            .map_err(|_| anyhow!("invalid private key length"))?;
        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    pub fn auth_headers(&self, signed_path: &str, date: &str) -> Result<[(&'static str, String); 3]> {
        Ok([
            ("DTAPI-Token", self.public_key.clone()),
            ("DTAPI-Date", date.to_string()),
            ("DTAPI-Signature", self.signature(signed_path, date)?),
        ])
    }

    fn endpoint_url(&self, endpoint: &str, query: &[(&str, String)]) -> Result<Url> {
        let normalized = endpoint.trim_start_matches('/');
        let mut url = self
            .base_url
            .join(normalized)
            .with_context(|| format!("joining endpoint `{}` to host", endpoint))?;
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        Ok(url)
    }

    fn request(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, String)],
        form: Option<&[(&str, String)]>,
    ) -> Result<Value> {
        let signed_url = self.endpoint_url(endpoint, query)?;
        let signed = signed_path(&signed_url);
        // form posts carry their parameters in the body only
        let url = match form {
            Some(_) => self.endpoint_url(endpoint, &[])?,
            None => signed_url,
        };

        let date = Utc::now().format(SIGNATURE_DATE_FORMAT).to_string();
        debug!(%method, %url, signed_path = %signed, "sending request");

        let mut request = self
            .http
            .request(method, url)
            .header(ACCEPT, HeaderValue::from_static("application/json"));
        for (name, value) in self.auth_headers(&signed, &date)? {
            request = request.header(name, value);
        }
        if let Some(form) = form {
            request = request.form(form);
        }

        let response = request.send().map_err(|err| {
            if err.is_connect() {
                anyhow::Error::new(ApiError::Connection(self.base_url.to_string()))
            } else {
                anyhow::Error::new(err).context("sending request")
            }
        })?;

        let status = response.status();
        let text = response.text().context("reading response body")?;
        debug!(status = status.as_u16(), bytes = text.len(), "received response");

        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                endpoint: signed,
                body: text,
            }
            .into());
        }

        parse_body(&signed, &text)
    }
}

impl ApiQuery for ApiClient {
    fn get(&self, endpoint: &str, query: &[(&str, String)]) -> Result<Value> {
        self.request(Method::GET, endpoint, query, None)
    }

    fn post(
        &self,
        endpoint: &str,
        form: &[(&str, String)],
        query: &[(&str, String)],
    ) -> Result<Value> {
        self.request(Method::POST, endpoint, query, Some(form))
    }

    fn delete(&self, endpoint: &str, query: &[(&str, String)]) -> Result<Value> {
        self.request(Method::DELETE, endpoint, query, None)
    }
}

fn signed_path(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

fn parse_body(endpoint: &str, text: &str) -> Result<Value> {
    match serde_json::from_str(text) {
        Ok(json) => Ok(json),
        Err(_) if text.contains(LOGIN_PAGE_MARKER) => {
            Err(ApiError::UnsupportedEndpoint(endpoint.to_string()).into())
        }
        Err(_) => Ok(Value::String(text.to_string())),
    }
}

pub fn expect_array(value: Value, endpoint: &str) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        _ => Err(ApiError::UnexpectedShape {
            expected: "array",
            endpoint: endpoint.to_string(),
        }
        .into()),
    }
}

pub fn expect_object(value: Value, endpoint: &str) -> Result<serde_json::Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ApiError::UnexpectedShape {
            expected: "object",
            endpoint: endpoint.to_string(),
        }
        .into()),
    }
}
