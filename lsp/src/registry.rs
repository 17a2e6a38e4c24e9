//! Method-name → handler mapping used by the dispatcher.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use lsprobe_types::{ClientError, Notification, ResponseError};
use serde_json::Value;

pub type NotificationHandler = Box<dyn FnMut(&Notification) + Send>;

pub type RequestHandler =
    Box<dyn FnMut(Option<Value>) -> BoxFuture<'static, Result<Value, ResponseError>> + Send>;

/// A handler tagged with the kind of message it can serve.
pub enum Handler {
    Notification(NotificationHandler),
    Request(RequestHandler),
}

/// Reject names no well-behaved peer could send.
///
/// `rpc.` is reserved by JSON-RPC 2.0.
pub fn validate_method(method: &str) -> Result<(), ClientError> {
    let invalid = method.is_empty()
        || method.starts_with("rpc.")
        || method.chars().any(|c| c.is_whitespace() || c.is_control());
    if invalid {
        return Err(ClientError::InvalidMethod(method.to_string()));
    }
    Ok(())
}

#[derive(Default)]
pub(crate) struct HandlerRegistry {
    notifications: HashMap<String, Vec<NotificationHandler>>,
    requests: HashMap<String, RequestHandler>,
}

impl HandlerRegistry {
    /// Notification handlers accumulate; a request handler replaces any
    /// previous one for the same method.
    pub fn register(&mut self, method: &str, handler: Handler) -> Result<(), ClientError> {
        validate_method(method)?;
        match handler {
            Handler::Notification(h) => {
                self.notifications
                    .entry(method.to_string())
                    .or_default()
                    .push(h);
            }
            Handler::Request(h) => {
                if self.requests.insert(method.to_string(), h).is_some() {
                    tracing::debug!(method, "replaced server request handler");
                }
            }
        }
        Ok(())
    }

    /// Run every handler for the notification in registration order.
    ///
    /// Returns how many handlers ran. A panicking handler is logged and
    /// skipped; the others still run.
    pub fn notify(&mut self, notification: &Notification) -> usize {
        let Some(handlers) = self.notifications.get_mut(&notification.method) else {
            return 0;
        };
        for handler in handlers.iter_mut() {
            if catch_unwind(AssertUnwindSafe(|| handler(notification))).is_err() {
                tracing::warn!(method = %notification.method, "notification handler panicked");
            }
        }
        handlers.len()
    }

    /// Start the handler for a server request, if one is registered.
    pub fn call(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Option<BoxFuture<'static, Result<Value, ResponseError>>> {
        let handler = self.requests.get_mut(method)?;
        let method = method.to_string();
        let started = catch_unwind(AssertUnwindSafe(|| handler(params)));
        Some(match started {
            Ok(fut) => AssertUnwindSafe(fut)
                .catch_unwind()
                .map(move |outcome| {
                    outcome.unwrap_or_else(|_| {
                        tracing::warn!(%method, "server request handler panicked");
                        Err(ResponseError::internal(format!("handler for {method} panicked")))
                    })
                })
                .boxed(),
            Err(_) => {
                tracing::warn!(%method, "server request handler panicked");
                let error = ResponseError::internal(format!("handler for {method} panicked"));
                futures_util::future::ready(Err(error)).boxed()
            }
        })
    }
}
