//! Conversions from each supported inbound schema to the canonical task.
//!
//! Every adapter validates before it builds anything, and the same rules run
//! for every format.

use crate::{
    error::RequestError,
    models::{
        message::MessageTask,
        request::{GrafanaQuery, GrafanaRequest, MessageRequest},
    },
};

/// Native format: identity mapping once the request validates.
pub fn from_native(request: MessageRequest) -> Result<MessageTask, RequestError> {
    MessageTask::try_from(request)
}

/// Alerting webhook: credentials come from the query string and are injected
/// before validation; `externalURL` becomes the task url.
pub fn from_grafana(
    request: GrafanaRequest,
    query: GrafanaQuery,
) -> Result<MessageTask, RequestError> {
    let request = request.with_credentials(query);
    MessageTask::try_from(MessageRequest::from(request))
}
