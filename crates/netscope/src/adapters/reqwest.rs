//! `reqwest` adapter.
//!
//! [`InterceptedClient`] wraps a `reqwest::Client` and runs the interception
//! contract around `execute`. Bodies built from bytes are observed; streaming
//! bodies cannot be read without consuming them, so such requests pass
//! through unrecorded.
//!
//! The returned response is rebuilt from the buffered status, version,
//! headers and body, keeping the final URL and the connection extensions so
//! `url()` and `remote_addr()` read the same as without interception.

use super::{begin, report_response, LibraryAdapter};
use crate::engine::Engine;
use crate::error::ConversionError;
use crate::model::{Body, Headers, Method, Request, Response, Timing, TransportErrorKind, TransportFailure};
use ::hyper::StatusCode;
use ::reqwest::{IntoUrl, RequestBuilder, ResponseBuilderExt};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;

pub struct ReqwestAdapter;

impl LibraryAdapter for ReqwestAdapter {
    type NativeRequest = ::reqwest::Request;
    type NativeResponse = ::hyper::Response<Bytes>;

    const NAME: &'static str = "reqwest";

    fn request_to_canonical(
        native: &::reqwest::Request,
        library: &str,
    ) -> Result<Request, ConversionError> {
        let method = Method::try_from(native.method())?;
        let headers = Headers::from_header_map(native.headers());
        let body = match native.body() {
            None => None,
            Some(body) => {
                let bytes = body.as_bytes().ok_or(ConversionError::StreamingBody)?;
                Some(Body::from_headers(Bytes::copy_from_slice(bytes), &headers))
            }
        };

        Ok(Request::new(method, native.url().clone(), library)
            .with_headers(headers)
            .with_body(body))
    }

    fn request_from_canonical(request: &Request) -> Result<::reqwest::Request, ConversionError> {
        let mut native = ::reqwest::Request::new(request.method().to_http()?, request.url().clone());
        *native.headers_mut() = request.headers().to_header_map()?;
        if let Some(body) = request.body() {
            *native.body_mut() = Some(::reqwest::Body::from(body.bytes.clone()));
        }
        Ok(native)
    }

    fn response_to_canonical(
        native: &::hyper::Response<Bytes>,
        timing: Timing,
    ) -> Result<Response, ConversionError> {
        let headers = Headers::from_header_map(native.headers());
        let body = (!native.body().is_empty()).then(|| Body::from_headers(native.body().clone(), &headers));
        Ok(Response::new(native.status().as_u16())
            .with_headers(headers)
            .with_body(body)
            .with_timing(timing))
    }

    fn response_from_canonical(response: &Response) -> Result<::hyper::Response<Bytes>, ConversionError> {
        let status = StatusCode::from_u16(response.status())
            .map_err(|_| ConversionError::InvalidStatus(response.status()))?;
        let mut native = ::hyper::Response::new(Bytes::copy_from_slice(response.body_bytes()));
        *native.status_mut() = status;
        *native.headers_mut() = response.headers().to_header_map()?;
        Ok(native)
    }
}

/// Summarize a `reqwest` error for the recorder.
pub fn classify(err: &::reqwest::Error) -> TransportFailure {
    let kind = if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_connect() {
        TransportErrorKind::Connect
    } else if err.is_body() || err.is_decode() {
        TransportErrorKind::Body
    } else if err.is_request() || err.is_builder() || err.is_redirect() {
        TransportErrorKind::Request
    } else {
        TransportErrorKind::Other
    };
    TransportFailure::new(kind, TransportFailure::from_error(err).message)
}

/// A `reqwest::Client` whose calls go through the interception engine.
#[derive(Clone)]
pub struct InterceptedClient {
    inner: ::reqwest::Client,
    engine: Arc<Engine>,
    name: String,
}

impl InterceptedClient {
    pub fn new(inner: ::reqwest::Client, engine: Arc<Engine>) -> Self {
        Self {
            inner,
            engine,
            name: ReqwestAdapter::NAME.to_string(),
        }
    }

    /// Adapter name recorded on transactions.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn inner(&self) -> &::reqwest::Client {
        &self.inner
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Start building a request. Send it with [`send`](Self::send) so it is
    /// intercepted.
    pub fn request<U: IntoUrl>(&self, method: ::reqwest::Method, url: U) -> RequestBuilder {
        self.inner.request(method, url)
    }

    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.inner.get(url)
    }

    pub fn post<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.inner.post(url)
    }

    pub async fn send(&self, builder: RequestBuilder) -> ::reqwest::Result<::reqwest::Response> {
        self.execute(builder.build()?).await
    }

    pub async fn execute(
        &self,
        mut request: ::reqwest::Request,
    ) -> ::reqwest::Result<::reqwest::Response> {
        let converted = ReqwestAdapter::request_to_canonical(&request, &self.name);
        let Some(decision) = begin(&self.engine, &self.name, converted) else {
            return self.inner.execute(request).await;
        };

        if decision.is_mocked() {
            *request.url_mut() = decision.actual_or_mock_request_url().clone();
        }
        let started = Utc::now();

        let response = match self.inner.execute(request).await {
            Ok(response) => response,
            Err(err) => {
                let _ = decision.on_failure(classify(&err));
                return Err(err);
            }
        };

        let status = response.status();
        let version = response.version();
        let headers = response.headers().clone();
        let final_url = response.url().clone();
        let extensions = response.extensions().clone();
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = decision.on_failure(classify(&err));
                return Err(err);
            }
        };

        let mut buffered = ::hyper::Response::builder()
            .url(final_url)
            .body(bytes.clone())
            .unwrap_or_else(|_| ::hyper::Response::new(bytes));
        *buffered.status_mut() = status;
        *buffered.version_mut() = version;
        *buffered.headers_mut() = headers;
        buffered.extensions_mut().extend(extensions);

        report_response::<ReqwestAdapter>(&decision, &buffered, Timing::since(started));
        Ok(::reqwest::Response::from(buffered))
    }
}

/// Attach interception to a `reqwest::Client`.
pub trait ReqwestInterceptExt {
    fn intercepted(self, engine: Arc<Engine>) -> InterceptedClient;
}

impl ReqwestInterceptExt for ::reqwest::Client {
    fn intercepted(self, engine: Arc<Engine>) -> InterceptedClient {
        InterceptedClient::new(self, engine)
    }
}
