//! Handler context.

use polymcp_protocol::types::{
    CreateMessageParams, CreateMessageResult, ElicitParams, ElicitResult, ListRootsResult,
    LoggingMessageParams, ProgressParams, ProgressToken,
};
use polymcp_protocol::{McpResult, Method, RequestId};
use tokio_util::sync::CancellationToken;

use crate::protocol::{RequestContext, RequestOptions};
use crate::session::ServerSession;

/// What a feature handler sees while it runs: the owning session and the
/// inbound request it is serving.
///
/// Server→client calls made through the context are tied to the inbound
/// request, so stream transports deliver them on the request's stream.
/// The context is only meaningful for the duration of the handler.
#[derive(Clone)]
pub struct Context {
    session: ServerSession,
    request: RequestContext,
    progress_token: Option<ProgressToken>,
}

impl Context {
    pub(crate) fn new(
        session: ServerSession,
        request: RequestContext,
        progress_token: Option<ProgressToken>,
    ) -> Self {
        Self {
            session,
            request,
            progress_token,
        }
    }

    /// The session serving this request.
    pub fn session(&self) -> &ServerSession {
        &self.session
    }

    /// Id of the inbound request being served.
    pub fn request_id(&self) -> Option<&RequestId> {
        self.request.request_id.as_ref()
    }

    /// Trips when the peer cancels this request; long handlers should check
    /// it at natural suspension points.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.request.cancellation
    }

    /// True once the request has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.request.is_cancelled()
    }

    fn related_options(&self) -> RequestOptions {
        match &self.request.request_id {
            Some(id) => RequestOptions::related_to(id.clone()),
            None => RequestOptions::default(),
        }
    }

    /// Ask the client to sample a model response.
    pub async fn create_message(
        &self,
        params: CreateMessageParams,
    ) -> McpResult<CreateMessageResult> {
        self.session
            .create_message_with_options(params, self.related_options())
            .await
    }

    /// Ask the client for its filesystem roots.
    pub async fn list_roots(&self) -> McpResult<ListRootsResult> {
        self.session
            .list_roots_with_options(self.related_options())
            .await
    }

    /// Ask the client's user for structured input.
    pub async fn elicit(&self, params: ElicitParams) -> McpResult<ElicitResult> {
        self.session
            .elicit_with_options(params, self.related_options())
            .await
    }

    /// Send a log message to the client, subject to the session's level.
    pub async fn send_logging_message(&self, params: LoggingMessageParams) -> McpResult<()> {
        self.session.send_logging_message(params).await
    }

    /// Report progress on this request.
    ///
    /// Quietly does nothing when the request carried no progress token.
    pub async fn report_progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> McpResult<()> {
        let Some(token) = self.progress_token.clone() else {
            tracing::debug!("progress reported for a request without a progress token");
            return Ok(());
        };
        let params = ProgressParams {
            progress_token: token,
            progress,
            total,
            message,
        };
        self.session
            .notify_with_related(
                &Method::NotificationProgress,
                Some(serde_json::to_value(params)?),
                self.request.request_id.clone(),
            )
            .await
    }
}
