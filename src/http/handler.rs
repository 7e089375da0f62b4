//! Application handler contract.

use std::future::Future;

use futures_util::future::BoxFuture;

use crate::http::error::BoxError;
use crate::http::request::HttpServerRequest;
use crate::http::response::HttpServerResponse;

/// Handles one request/response exchange.
///
/// The response should be sent before the returned future completes;
/// otherwise an empty response is written on the handler's behalf.
pub trait HttpHandler: Send + Sync + 'static {
    fn handle(
        &self,
        request: HttpServerRequest,
        response: HttpServerResponse,
    ) -> BoxFuture<'static, Result<(), BoxError>>;
}

impl<F, Fut> HttpHandler for F
where
    F: Fn(HttpServerRequest, HttpServerResponse) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    fn handle(
        &self,
        request: HttpServerRequest,
        response: HttpServerResponse,
    ) -> BoxFuture<'static, Result<(), BoxError>> {
        Box::pin(self(request, response))
    }
}
