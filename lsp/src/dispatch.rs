//! Inbound message routing.
//!
//! Every decoded message passes through [`Dispatcher::route`] in arrival
//! order. Routing itself never awaits: responses are matched, notification
//! handlers run synchronously, and server-request handlers hand back a future
//! for the connection loop to poll alongside everything else.

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use lsprobe_types::{
    Anomaly, Message, Notification, Request, Response, ResponseError, ResponseOutcome,
};
use tokio::sync::broadcast;

use crate::pending::{Lookup, PendingCall, PendingTable};
use crate::registry::HandlerRegistry;
use crate::types::ClientEvent;

pub(crate) const BROADCAST_CAPACITY: usize = 1024;

pub(crate) enum Routed {
    /// A response claimed an outstanding call. The caller resolves it, so the
    /// session can act on lifecycle replies first.
    Matched {
        method: String,
        call: PendingCall,
        outcome: ResponseOutcome,
    },
    /// Reply to send immediately.
    Reply(Response),
    /// Server-request handler still running; resolves to the reply.
    Handling(BoxFuture<'static, Response>),
    Done,
}

pub(crate) struct Dispatcher {
    pub pending: PendingTable,
    pub registry: HandlerRegistry,
    pub strict: bool,
    notifications: broadcast::Sender<Notification>,
    events: broadcast::Sender<ClientEvent>,
}

impl Dispatcher {
    pub fn new(
        pending: PendingTable,
        strict: bool,
        notifications: broadcast::Sender<Notification>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            pending,
            registry: HandlerRegistry::default(),
            strict,
            notifications,
            events,
        }
    }

    pub fn route(&mut self, message: Message) -> Routed {
        match message {
            Message::Response(response) => self.route_response(response),
            Message::Notification(notification) => {
                self.route_notification(notification);
                Routed::Done
            }
            Message::Request(request) => self.route_request(request),
        }
    }

    fn route_response(&mut self, response: Response) -> Routed {
        match self.pending.take_for_response(&response.id) {
            Lookup::Outstanding(call) => {
                tracing::debug!(id = %response.id, method = %call.method, "response");
                Routed::Matched {
                    method: call.method.clone(),
                    call,
                    outcome: response.outcome,
                }
            }
            Lookup::Late { method } => {
                self.report(Anomaly::LateResponse {
                    id: response.id,
                    method,
                });
                Routed::Done
            }
            Lookup::Duplicate { method } => {
                self.report(Anomaly::DuplicateResponse {
                    id: response.id,
                    method,
                });
                Routed::Done
            }
            Lookup::Unknown => {
                self.report(Anomaly::UnsolicitedResponse(response.id));
                Routed::Done
            }
        }
    }

    fn route_notification(&mut self, notification: Notification) {
        tracing::debug!(method = %notification.method, "notification");
        let handled = self.registry.notify(&notification);
        if handled == 0 && self.strict && !notification.method.starts_with("$/") {
            self.report(Anomaly::UnhandledNotification(notification.method.clone()));
        }
        // No subscribers is fine.
        let _ = self.notifications.send(notification);
    }

    fn route_request(&mut self, request: Request) -> Routed {
        let Request { id, method, params } = request;
        match self.registry.call(&method, params) {
            Some(fut) => {
                tracing::debug!(%id, %method, "server request");
                Routed::Handling(
                    fut.map(move |outcome| match outcome {
                        Ok(result) => Response::success(id, result),
                        Err(error) => Response::error(id, error),
                    })
                    .boxed(),
                )
            }
            None => {
                tracing::debug!(
                    %id,
                    %method,
                    "server request without handler, replying method not found"
                );
                Routed::Reply(Response::error(id, ResponseError::method_not_found(&method)))
            }
        }
    }

    pub fn report(&self, anomaly: Anomaly) {
        tracing::warn!(kind = anomaly.kind(), "protocol anomaly: {anomaly}");
        let _ = self.events.send(ClientEvent::Anomaly(anomaly));
    }

    pub fn publish(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}
