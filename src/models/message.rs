use serde::{Deserialize, Serialize};

use crate::{
    error::RequestError,
    models::{request::MessageRequest, validation::validate_message},
};

/// Task kind the delivery worker subscribes to.
pub const TASK_KIND: &str = "message";

/// The normalized notification handed to the queue.
///
/// Only obtainable through [`TryFrom<MessageRequest>`] or [`MessageTask::decode`],
/// both of which validate first, so a half-filled task cannot exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageTask {
    user: String,
    token: String,
    title: String,
    message: String,
    url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<i8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sound: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    html: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    monospace: Option<u8>,
}

impl TryFrom<MessageRequest> for MessageTask {
    type Error = RequestError;

    fn try_from(request: MessageRequest) -> Result<Self, Self::Error> {
        validate_message(&request)?;

        Ok(Self {
            user: request.user,
            token: request.token,
            title: request.title,
            message: request.message,
            url: request.url,
            device: request.device,
            url_title: request.url_title,
            priority: request.priority,
            sound: request.sound,
            timestamp: request.timestamp,
            html: request.html,
            monospace: request.monospace,
        })
    }
}

impl<'de> Deserialize<'de> for MessageTask {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let request = MessageRequest::deserialize(deserializer)?;
        MessageTask::try_from(request).map_err(serde::de::Error::custom)
    }
}

impl MessageTask {
    /// Deterministic JSON encoding used as the queue payload.
    pub fn encode(&self) -> Result<Vec<u8>, RequestError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, RequestError> {
        serde_json::from_slice(payload).map_err(|e| RequestError::Malformed(e.to_string()))
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn url_title(&self) -> Option<&str> {
        self.url_title.as_deref()
    }

    pub fn priority(&self) -> Option<i8> {
        self.priority
    }

    pub fn sound(&self) -> Option<&str> {
        self.sound.as_deref()
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    pub fn html(&self) -> Option<u8> {
        self.html
    }

    pub fn monospace(&self) -> Option<u8> {
        self.monospace
    }
}
