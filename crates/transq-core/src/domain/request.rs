//! Submission input and the receipt handed back to the caller.

use serde::{Deserialize, Serialize};

use super::ids::RequestId;
use super::state::TaskStatus;

/// Raw submission as received from a client. Both fields are optional here
/// so validation can report every missing field at once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
}

/// A submission that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidRequest {
    pub text: String,
    pub to: String,
}

/// One or more required fields are absent or empty.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("missing required fields: {}", missing_fields.join(", "))]
pub struct InvalidRequest {
    pub missing_fields: Vec<&'static str>,
}

impl SubmitRequest {
    pub fn new(text: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            to: Some(to.into()),
        }
    }

    pub fn validate(self) -> Result<ValidRequest, InvalidRequest> {
        fn present(field: Option<String>) -> Option<String> {
            field.filter(|v| !v.is_empty())
        }

        let text = present(self.text);
        let to = present(self.to);

        let mut missing_fields = Vec::new();
        if text.is_none() {
            missing_fields.push("text");
        }
        if to.is_none() {
            missing_fields.push("to");
        }

        match (text, to) {
            (Some(text), Some(to)) => Ok(ValidRequest { text, to }),
            _ => Err(InvalidRequest { missing_fields }),
        }
    }
}

/// Acknowledgment of acceptance (not completion).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub request_id: RequestId,
    pub status: TaskStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(None, None, vec!["text", "to"])]
    #[case(Some(""), Some(""), vec!["text", "to"])]
    #[case(None, Some("pt"), vec!["text"])]
    #[case(Some(""), Some("pt"), vec!["text"])]
    #[case(Some("hello"), None, vec!["to"])]
    #[case(Some("hello"), Some(""), vec!["to"])]
    fn reports_every_missing_field(
        #[case] text: Option<&str>,
        #[case] to: Option<&str>,
        #[case] expected: Vec<&'static str>,
    ) {
        let req = SubmitRequest {
            text: text.map(str::to_string),
            to: to.map(str::to_string),
        };
        let err = req.validate().unwrap_err();
        assert_eq!(err.missing_fields, expected);
    }

    #[test]
    fn accepts_complete_request() {
        let valid = SubmitRequest::new("hello", "xx").validate().unwrap();
        assert_eq!(valid.text, "hello");
        assert_eq!(valid.to, "xx");
    }

    #[test]
    fn error_message_names_fields() {
        let err = SubmitRequest::default().validate().unwrap_err();
        assert_eq!(err.to_string(), "missing required fields: text, to");
    }
}
