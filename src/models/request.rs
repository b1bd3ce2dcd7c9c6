use serde::{Deserialize, Deserializer};

/// Body of `POST /1/messages.json`. Mirrors the canonical task field for field.
///
/// Required fields default to empty so that a missing field is reported as a
/// validation failure rather than a parse failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MessageRequest {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub user: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub token: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub message: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub url: String,

    pub device: Option<String>,
    pub url_title: Option<String>,
    pub priority: Option<i8>,
    pub sound: Option<String>,
    pub timestamp: Option<i64>,
    pub html: Option<u8>,
    pub monospace: Option<u8>,
}

/// Body of `POST /grafana`. Any other fields the alerting system sends are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct GrafanaRequest {
    #[serde(default, skip_deserializing)]
    pub user: String,
    #[serde(default, skip_deserializing)]
    pub token: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub message: String,
    #[serde(default, rename = "externalURL", deserialize_with = "null_as_empty")]
    pub external_url: String,
}

/// Query string of `POST /grafana`; the only source of credentials for that route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct GrafanaQuery {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub user: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub token: String,
}

/// Reads an explicit `null` the same as an absent field.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl GrafanaRequest {
    pub fn with_credentials(mut self, query: GrafanaQuery) -> Self {
        self.user = query.user;
        self.token = query.token;
        self
    }
}

impl From<GrafanaRequest> for MessageRequest {
    fn from(alert: GrafanaRequest) -> Self {
        Self {
            user: alert.user,
            token: alert.token,
            title: alert.title,
            message: alert.message,
            url: alert.external_url,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_strings_read_as_empty() {
        let request: MessageRequest = serde_json::from_str(
            r#"{"user":"u","token":"t","title":null,"message":"m","url":null,"priority":null}"#,
        )
        .unwrap();

        assert_eq!(request.title, "");
        assert_eq!(request.url, "");
        assert_eq!(request.priority, None);

        let alert: GrafanaRequest =
            serde_json::from_str(r#"{"message":"m","externalURL":null,"title":null}"#).unwrap();
        assert_eq!(alert.external_url, "");
    }
}
