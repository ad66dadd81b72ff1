//! hyper / tower adapter.
//!
//! [`InterceptLayer`] wraps any `tower::Service` that sends
//! `hyper::Request<Full<Bytes>>` and returns a `hyper::Response`, such as the
//! hyper-util legacy [`Client`]. The send step is intercepted: a mocked
//! request's URI is rewritten to the decision URL, the response body is
//! buffered once and handed back as `Full<Bytes>`.
//!
//! ```ignore
//! let service = InterceptLayer::new(engine).layer(build_http_client()?);
//! ```

use super::{begin, report_response, LibraryAdapter};
use crate::engine::{Engine, RoutingDecision};
use crate::error::ConversionError;
use crate::model::{Body, Headers, Method, Request, Response, Timing, TransportErrorKind, TransportFailure};
use ::hyper::body::Body as HttpBody;
use ::hyper::{StatusCode, Uri};
use bytes::Bytes;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{BoxError, Layer, Service};
use tracing::{info, warn};
use url::Url;

/// hyper-util client for plain HTTP and HTTPS (HTTP/1.1).
pub type HttpClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Build a pooled hyper-util client with webpki roots.
pub fn build_http_client() -> Result<HttpClient, rustls::Error> {
    let mut http_connector = HttpConnector::new();
    http_connector.set_connect_timeout(Some(Duration::from_secs(10)));
    http_connector.enforce_http(false);

    let https_connector = HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())?
        .https_or_http()
        .enable_http1()
        .wrap_connector(http_connector);

    let client = Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(90))
        .build(https_connector);
    info!("hyper client ready (HTTP/1.1, pooled)");
    Ok(client)
}

/// Intercepting hyper client built from [`build_http_client`].
pub fn intercepted_client(engine: Arc<Engine>) -> Result<InterceptService<HttpClient>, rustls::Error> {
    Ok(InterceptLayer::new(engine).layer(build_http_client()?))
}

pub struct HyperAdapter;

impl LibraryAdapter for HyperAdapter {
    type NativeRequest = ::hyper::Request<Full<Bytes>>;
    type NativeResponse = ::hyper::Response<Bytes>;

    const NAME: &'static str = "hyper";

    fn request_to_canonical(
        native: &::hyper::Request<Full<Bytes>>,
        library: &str,
    ) -> Result<Request, ConversionError> {
        let method = Method::try_from(native.method())?;
        let uri = native.uri().to_string();
        let url = Url::parse(&uri).map_err(|e| ConversionError::InvalidUrl {
            url: uri.clone(),
            reason: e.to_string(),
        })?;
        let headers = Headers::from_header_map(native.headers());

        // A `Full` body is ready immediately
        let bytes = native
            .body()
            .clone()
            .collect()
            .now_or_never()
            .and_then(Result::ok)
            .map(|collected| collected.to_bytes())
            .ok_or(ConversionError::StreamingBody)?;
        let body = (!bytes.is_empty()).then(|| Body::from_headers(bytes, &headers));

        Ok(Request::new(method, url, library)
            .with_headers(headers)
            .with_body(body))
    }

    fn request_from_canonical(
        request: &Request,
    ) -> Result<::hyper::Request<Full<Bytes>>, ConversionError> {
        let uri = to_uri(request.url())?;
        let mut native = ::hyper::Request::new(Full::new(Bytes::copy_from_slice(request.body_bytes())));
        *native.method_mut() = request.method().to_http()?;
        *native.uri_mut() = uri;
        *native.headers_mut() = request.headers().to_header_map()?;
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

fn to_uri(url: &Url) -> Result<Uri, ConversionError> {
    url.as_str()
        .parse::<Uri>()
        .map_err(|e| ConversionError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })
}

/// `tower::Layer` that intercepts the send step of a hyper client stack.
#[derive(Clone)]
pub struct InterceptLayer {
    engine: Arc<Engine>,
    name: String,
}

impl InterceptLayer {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            name: HyperAdapter::NAME.to_string(),
        }
    }

    /// Adapter name recorded on transactions.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl<S> Layer<S> for InterceptLayer {
    type Service = InterceptService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InterceptService {
            inner,
            engine: Arc::clone(&self.engine),
            name: self.name.clone(),
        }
    }
}

#[derive(Clone)]
pub struct InterceptService<S> {
    inner: S,
    engine: Arc<Engine>,
    name: String,
}

impl<S, B> Service<::hyper::Request<Full<Bytes>>> for InterceptService<S>
where
    S: Service<::hyper::Request<Full<Bytes>>, Response = ::hyper::Response<B>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<BoxError>,
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = ::hyper::Response<Full<Bytes>>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, mut req: ::hyper::Request<Full<Bytes>>) -> Self::Future {
        // The clone may not be ready; use the instance poll_ready was called on
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let engine = Arc::clone(&self.engine);
        let name = self.name.clone();

        Box::pin(async move {
            let converted = HyperAdapter::request_to_canonical(&req, &name);
            let Some(decision) = begin(&engine, &name, converted) else {
                let response = inner.call(req).await.map_err(Into::<BoxError>::into)?;
                let (buffered, _) = buffer(response).await?;
                return Ok(buffered);
            };

            // Pass-through keeps the caller's URI byte for byte
            if decision.is_mocked() {
                match to_uri(decision.actual_or_mock_request_url()) {
                    Ok(uri) => *req.uri_mut() = uri,
                    Err(e) => {
                        warn!("Transaction {}: cannot dial substitute URL: {}", decision.id(), e);
                        let _ = decision.on_failure(TransportFailure::new(
                            TransportErrorKind::Conversion,
                            e.to_string(),
                        ));
                        let response = inner.call(req).await.map_err(Into::<BoxError>::into)?;
                        let (buffered, _) = buffer(response).await?;
                        return Ok(buffered);
                    }
                }
            }

            let started = Utc::now();
            let response = match inner.call(req).await {
                Ok(response) => response,
                Err(err) => return Err(fail(&decision, err.into())),
            };
            let (buffered, native) = match buffer(response).await {
                Ok(parts) => parts,
                Err(err) => return Err(fail(&decision, err)),
            };

            report_response::<HyperAdapter>(&decision, &native, Timing::since(started));
            Ok(buffered)
        })
    }
}

fn fail(decision: &RoutingDecision, err: BoxError) -> BoxError {
    let _ = decision.on_error(&*err);
    err
}

/// Collect a streaming response into both the returned `Full` body and the
/// buffered form handed to the recorder.
async fn buffer<B>(
    response: ::hyper::Response<B>,
) -> Result<(::hyper::Response<Full<Bytes>>, ::hyper::Response<Bytes>), BoxError>
where
    B: HttpBody<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await.map_err(Into::<BoxError>::into)?.to_bytes();

    let mut native = ::hyper::Response::new(bytes.clone());
    *native.status_mut() = parts.status;
    *native.version_mut() = parts.version;
    *native.headers_mut() = parts.headers.clone();
    Ok((::hyper::Response::from_parts(parts, Full::new(bytes)), native))
}
