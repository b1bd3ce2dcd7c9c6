use crate::{error::RequestError, models::request::MessageRequest};

pub const MAX_MESSAGE_CHARS: usize = 1024;
pub const MAX_TITLE_CHARS: usize = 250;
pub const MAX_URL_CHARS: usize = 512;
pub const MAX_URL_TITLE_CHARS: usize = 100;

/// Checks every rule and reports all violations at once.
pub fn validate_message(request: &MessageRequest) -> Result<(), RequestError> {
    let mut violations = Vec::new();

    required("user", &request.user, &mut violations);
    required("token", &request.token, &mut violations);
    required("message", &request.message, &mut violations);

    max_chars("message", &request.message, MAX_MESSAGE_CHARS, &mut violations);
    max_chars("title", &request.title, MAX_TITLE_CHARS, &mut violations);
    max_chars("url", &request.url, MAX_URL_CHARS, &mut violations);
    if let Some(url_title) = &request.url_title {
        max_chars("url_title", url_title, MAX_URL_TITLE_CHARS, &mut violations);
    }

    if let Some(priority) = request.priority
        && !(-2..=2).contains(&priority)
    {
        violations.push(format!(
            "priority must be between -2 and 2, got {}",
            priority
        ));
    }

    flag("html", request.html, &mut violations);
    flag("monospace", request.monospace, &mut violations);
    if request.html == Some(1) && request.monospace == Some(1) {
        violations.push("html and monospace cannot both be enabled".to_string());
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(RequestError::Invalid(violations))
    }
}

fn required(field: &str, value: &str, violations: &mut Vec<String>) {
    if value.is_empty() {
        violations.push(format!("{} is required", field));
    }
}

fn max_chars(field: &str, value: &str, max: usize, violations: &mut Vec<String>) {
    let len = value.chars().count();
    if len > max {
        violations.push(format!(
            "{} too long ({} characters, maximum {})",
            field, len, max
        ));
    }
}

fn flag(field: &str, value: Option<u8>, violations: &mut Vec<String>) {
    if let Some(v) = value
        && v > 1
    {
        violations.push(format!("{} must be 0 or 1", field));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> MessageRequest {
        MessageRequest {
            user: "u123".into(),
            token: "a1b2c3".into(),
            message: "disk almost full".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_minimal_request_passes() {
        assert!(validate_message(&valid()).is_ok());
    }

    #[test]
    fn test_missing_required_fields_are_all_reported() {
        let err = validate_message(&MessageRequest::default()).unwrap_err();

        assert_eq!(
            err.messages(),
            vec![
                "user is required".to_string(),
                "token is required".to_string(),
                "message is required".to_string(),
            ]
        );
    }

    #[test]
    fn test_length_limits_count_characters_not_bytes() {
        let mut request = valid();
        request.message = "é".repeat(MAX_MESSAGE_CHARS);
        assert!(validate_message(&request).is_ok());

        request.message.push('é');
        let err = validate_message(&request).unwrap_err();
        assert!(err.messages()[0].starts_with("message too long"));
    }

    #[test]
    fn test_priority_out_of_range() {
        let mut request = valid();
        request.priority = Some(3);

        let err = validate_message(&request).unwrap_err();
        assert_eq!(err.messages(), vec!["priority must be between -2 and 2, got 3"]);
    }

    #[test]
    fn test_html_and_monospace_are_exclusive() {
        let mut request = valid();
        request.html = Some(1);
        request.monospace = Some(1);
        assert!(validate_message(&request).is_err());

        request.monospace = Some(0);
        assert!(validate_message(&request).is_ok());

        request.html = Some(2);
        let err = validate_message(&request).unwrap_err();
        assert_eq!(err.messages(), vec!["html must be 0 or 1"]);
    }
}
