//! Typed requests and notifications keyed by `lsp-types` method
//! definitions.

use lsp_types::notification::Notification;
use lsp_types::request::Request;
use tracing::warn;

use crate::connection::{CONNECTION_TARGET, Connection, PendingRequest, RequestOptions};
use crate::error::RpcError;
use crate::jsonrpc::{ErrorCode, ResponseError};

impl Connection {
    /// Sends the request described by `R`.
    ///
    /// # Errors
    ///
    /// See [`Connection::send_request`].
    pub fn request<R: Request>(
        &self,
        params: R::Params,
    ) -> Result<PendingRequest<R::Result>, RpcError> {
        self.send_request(R::METHOD, params)
    }

    /// Sends the request described by `R` with per-request options.
    ///
    /// # Errors
    ///
    /// See [`Connection::send_request`].
    pub fn request_with_options<R: Request>(
        &self,
        params: R::Params,
        options: RequestOptions,
    ) -> Result<PendingRequest<R::Result>, RpcError> {
        self.send_request_with_options(R::METHOD, params, options)
    }

    /// Sends the notification described by `N`.
    ///
    /// # Errors
    ///
    /// See [`Connection::send_notification`].
    pub fn notify<N: Notification>(&self, params: N::Params) -> Result<(), RpcError> {
        self.send_notification(N::METHOD, params)
    }

    /// Installs a handler for notification `N`. Notifications whose
    /// parameters do not decode are logged and dropped.
    pub fn on_typed_notification<N, F>(&self, handler: F)
    where
        N: Notification + 'static,
        F: Fn(N::Params) + Send + 'static,
    {
        self.on_notification(N::METHOD, move |notification| {
            match notification.params_as::<N::Params>() {
                Ok(params) => handler(params),
                Err(error) => warn!(
                    target: CONNECTION_TARGET,
                    method = N::METHOD,
                    %error,
                    "dropping notification with undecodable params"
                ),
            }
        });
    }

    /// Installs a handler for peer request `R`. Undecodable parameters are
    /// answered with `InvalidParams` without calling `handler`.
    pub fn on_typed_request<R, F>(&self, handler: F)
    where
        R: Request + 'static,
        F: Fn(R::Params) -> Result<R::Result, ResponseError> + Send + 'static,
    {
        self.on_request(R::METHOD, move |request, responder| {
            let params = match request.params_as::<R::Params>() {
                Ok(params) => params,
                Err(error) => {
                    responder.respond_err(ResponseError::new(
                        ErrorCode::InvalidParams,
                        format!("invalid params for {}: {error}", R::METHOD),
                    ));
                    return;
                }
            };
            match handler(params) {
                Ok(result) => responder.respond_ok(&result),
                Err(error) => responder.respond_err(error),
            }
        });
    }
}
