//! Reactive bridge between protocol codecs and application handlers.
//!
//! # Responsibilities
//! - Turn a decoded request into an `HttpServerRequest`/`HttpServerResponse` pair
//! - Apply the configured setup hook and the per-response compression predicate
//! - Route the committed response to the HTTP/1.1 pipelining writer or the
//!   HTTP/2 stream
//! - Report the terminal outcome of every exchange to the observer exactly once
//!
//! # Design Decisions
//! - One bridge per request (HTTP/1.1) or per stream (HTTP/2); nothing here
//!   outlives the exchange
//! - The outbound half sits behind a mutex and is taken on send, so a second
//!   send fails with `AlreadySent` instead of writing twice
//! - A handler that returns without sending gets an empty response; a
//!   handler that fails gets a 500 if nothing was committed yet

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use http::header::ACCEPT_ENCODING;
use http::StatusCode;
use tokio::sync::oneshot;

use crate::http::compression::{self, CompressPredicate};
use crate::http::error::HttpError;
use crate::http::forwarded;
use crate::http::handler::HttpHandler;
use crate::http::request::{HttpServerRequest, RequestBody, RequestHead};
use crate::http::response::{HttpServerResponse, ResponseBody, ResponseHead};
use crate::net::connection::{ConnectionInfo, ConnectionObserver, ConnectionState};
use crate::observability::metrics;
use crate::pipeline::ConnectionContext;

/// Hook run against the operations of each new exchange before the handler.
#[derive(Clone, Default)]
pub struct SetupHook(Option<Arc<dyn Fn(&mut ReactiveOperations) + Send + Sync>>);

impl SetupHook {
    /// The no-op hook.
    pub fn empty() -> Self {
        SetupHook(None)
    }

    pub fn new<F>(hook: F) -> Self
    where
        F: Fn(&mut ReactiveOperations) + Send + Sync + 'static,
    {
        SetupHook(Some(Arc::new(hook)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    fn apply(&self, operations: &mut ReactiveOperations) {
        if let Some(hook) = &self.0 {
            hook(operations);
        }
    }
}

impl std::fmt::Debug for SetupHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.is_empty() { "SetupHook(empty)" } else { "SetupHook(..)" })
    }
}

/// A committed response travelling from the bridge to the protocol writer.
pub(crate) struct ResponseMessage {
    pub(crate) head: ResponseHead,
    pub(crate) body: ResponseBody,
    /// Resolved once the response is flushed, or failed.
    pub(crate) completion: Option<oneshot::Sender<Result<(), HttpError>>>,
    /// Settles the exchange with the outcome of the write.
    pub(crate) reporter: Option<ExchangeReporter>,
}

/// Where a committed response goes: the HTTP/1.1 pipelining queue slot or
/// the writer of an HTTP/2 stream.
pub(crate) type ResponseSlot = oneshot::Sender<ResponseMessage>;

/// Hand a response to the writer and wait until it is on the wire.
pub(crate) async fn dispatch(
    slot: ResponseSlot,
    head: ResponseHead,
    body: ResponseBody,
    reporter: Option<ExchangeReporter>,
) -> Result<(), HttpError> {
    let (done_tx, done_rx) = oneshot::channel();
    slot.send(ResponseMessage {
        head,
        body,
        completion: Some(done_tx),
        reporter,
    })
    .map_err(|_| HttpError::ConnectionClosed)?;
    done_rx.await.map_err(|_| HttpError::ConnectionClosed)?
}

/// State shared by the request, the response and the bridge driver.
pub(crate) struct BridgeShared {
    connection: Arc<ConnectionInfo>,
    observer: Arc<dyn ConnectionObserver>,
    request: Arc<RequestHead>,
    compress: Option<CompressPredicate>,
    outbound: Mutex<Option<ResponseSlot>>,
    /// Head left behind by a response dropped without sending.
    stashed: Mutex<Option<ResponseHead>>,
    terminated: AtomicBool,
}

impl BridgeShared {
    pub(crate) fn request(&self) -> &RequestHead {
        &self.request
    }

    pub(crate) fn is_sent(&self) -> bool {
        lock(&self.outbound).is_none()
    }

    pub(crate) fn stash_head(&self, head: ResponseHead) {
        *lock(&self.stashed) = Some(head);
    }

    fn take_outbound(&self) -> Option<ResponseSlot> {
        lock(&self.outbound).take()
    }

    /// Commit the response. Fails with `AlreadySent` on a second call.
    pub(crate) async fn send(
        self: &Arc<Self>,
        head: ResponseHead,
        body: ResponseBody,
    ) -> Result<(), HttpError> {
        let outbound = self.take_outbound().ok_or(HttpError::AlreadySent)?;
        let result = self.write(outbound, head, body).await;
        match &result {
            Ok(()) => self.complete(),
            Err(error) => self.fail(error),
        }
        result
    }

    async fn write(
        self: &Arc<Self>,
        outbound: ResponseSlot,
        mut head: ResponseHead,
        mut body: ResponseBody,
    ) -> Result<(), HttpError> {
        if let Some(predicate) = &self.compress {
            if predicate(&self.request, &head) {
                let coding = compression::select_coding(
                    &self.request.method,
                    self.request.headers.get(ACCEPT_ENCODING),
                    &head,
                    &body,
                );
                if let Some(coding) = coding {
                    body = compression::encode(coding, &mut head, body);
                }
            }
        }

        let reporter = ExchangeReporter(Arc::clone(self));
        dispatch(outbound, head, body, Some(reporter)).await
    }

    fn complete(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.observer
                .on_state_change(&self.connection, ConnectionState::ResponseCompleted);
        }
    }

    fn fail(&self, error: &HttpError) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            tracing::debug!(
                connection_id = %self.connection.id(),
                stream_id = ?self.connection.stream_id(),
                error = %error,
                "Exchange failed"
            );
            metrics::record_error(error);
            self.observer.on_error(&self.connection, error);
        }
    }
}

/// Lets a protocol writer settle an exchange once its response is on the wire.
///
/// The writer can outlive the exchange task, which is aborted with the
/// connection or stream, so the terminal state is reported from the writer side.
pub(crate) struct ExchangeReporter(Arc<BridgeShared>);

impl ExchangeReporter {
    pub(crate) fn written(&self, result: Result<(), &HttpError>) {
        match result {
            Ok(()) => self.0.complete(),
            Err(error) => self.0.fail(error),
        }
    }

    pub(crate) fn fail(&self, error: &HttpError) {
        self.0.fail(error);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The request/response pair for one exchange, ready for a handler.
pub struct ReactiveOperations {
    request: HttpServerRequest,
    response: HttpServerResponse,
    shared: Arc<BridgeShared>,
}

impl ReactiveOperations {
    pub fn request(&self) -> &HttpServerRequest {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut HttpServerRequest {
        &mut self.request
    }

    pub fn response(&self) -> &HttpServerResponse {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut HttpServerResponse {
        &mut self.response
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.shared.connection
    }

    /// Handle for settling this exchange from outside the handler task.
    pub(crate) fn reporter(&self) -> ExchangeReporter {
        ExchangeReporter(Arc::clone(&self.shared))
    }

    /// Run the handler and finalize the exchange.
    pub(crate) async fn run(self, handler: Arc<dyn HttpHandler>) {
        let ReactiveOperations {
            request,
            response,
            shared,
        } = self;
        let guard = CancelGuard(Arc::clone(&shared));

        match handler.handle(request, response).await {
            Ok(()) => {
                if let Some(outbound) = shared.take_outbound() {
                    let head = lock(&shared.stashed).take().unwrap_or_default();
                    match shared.write(outbound, head, ResponseBody::Empty).await {
                        Ok(()) => shared.complete(),
                        Err(error) => shared.fail(&error),
                    }
                }
            }
            Err(error) => {
                let error = match error.downcast::<HttpError>() {
                    Ok(error) => *error,
                    Err(error) => HttpError::Handler(error),
                };
                // Settled before the 500 goes out so the writer cannot
                // report it as a completed response.
                shared.fail(&error);
                if let Some(outbound) = shared.take_outbound() {
                    let head = ResponseHead::new(StatusCode::INTERNAL_SERVER_ERROR);
                    if let Err(write_error) = shared.write(outbound, head, ResponseBody::Empty).await {
                        tracing::debug!(error = %write_error, "Failed to write error response");
                    }
                }
            }
        }
        drop(guard);
    }
}

impl std::fmt::Debug for ReactiveOperations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveOperations")
            .field("request", &self.request)
            .field("response", &self.response)
            .finish()
    }
}

/// Reports cancellation if the exchange is torn down before it terminates.
struct CancelGuard(Arc<BridgeShared>);

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.0.fail(&HttpError::Cancelled);
    }
}

/// Attach a bridge to a decoded request.
///
/// Emits `RequestReceived` and applies `setup` before returning.
pub(crate) fn attach(
    ctx: &ConnectionContext,
    head: RequestHead,
    body: RequestBody,
    outbound: ResponseSlot,
    setup: &SetupHook,
) -> ReactiveOperations {
    let head = Arc::new(head);
    let forwarded = if ctx.config.forwarded {
        forwarded::parse(&head.headers)
    } else {
        None
    };

    let shared = Arc::new(BridgeShared {
        connection: Arc::clone(&ctx.info),
        observer: Arc::clone(&ctx.observer),
        request: Arc::clone(&head),
        compress: ctx.config.compress_predicate.clone(),
        outbound: Mutex::new(Some(outbound)),
        stashed: Mutex::new(None),
        terminated: AtomicBool::new(false),
    });

    metrics::record_request(head.version);
    ctx.observer
        .on_state_change(&ctx.info, ConnectionState::RequestReceived);

    let mut operations = ReactiveOperations {
        request: HttpServerRequest::new(head, body, Arc::clone(&ctx.info), forwarded),
        response: HttpServerResponse::new(Arc::clone(&shared)),
        shared,
    };
    setup.apply(&mut operations);
    operations
}
