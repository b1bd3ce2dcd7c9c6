use serde::{Deserialize, Serialize};

pub const STATUS_ACCEPTED: u8 = 1;
pub const STATUS_REJECTED: u8 = 0;

/// Body returned on every route, success or not.
///
/// `error` is the joined form of `errors`, kept for clients that only read
/// the single-string field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub status: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    pub request: String,
}

impl Envelope {
    pub fn accepted(request: impl Into<String>) -> Self {
        Self {
            status: STATUS_ACCEPTED,
            error: None,
            errors: Vec::new(),
            request: request.into(),
        }
    }

    pub fn rejected(request: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            status: STATUS_REJECTED,
            error: Some(errors.join("; ")),
            errors,
            request: request.into(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == STATUS_ACCEPTED
    }
}
