use serde_json::Value;

use crate::store::backend::{SortedEntry, VersionInfo};

/// Value returned by a backend call, tagged by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Value(Value),
    Integer(i64),
    Keys(Vec<String>),
    Versions(Vec<VersionInfo>),
    Sorted(Vec<SortedEntry>),
}

/// Result record delivered once per request.
///
/// `success` is true only when the backend call completed without error and either
/// the operation is a write, or the read produced a value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequestOutcome {
    pub success: bool,
    pub error_message: Option<String>,
    pub value: Option<Payload>,
}

impl RequestOutcome {
    pub fn success(value: Option<Payload>) -> Self {
        Self {
            success: true,
            error_message: None,
            value,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            value: None,
        }
    }

    /// A read completed but the backend returned nothing.
    pub fn no_value() -> Self {
        Self::failure("Backend returned no value")
    }
}

/// Conversion from a [`Payload`] into the value type a facade call returns.
pub trait FromPayload: Sized {
    fn from_payload(payload: Payload) -> Option<Self>;
}

impl FromPayload for Value {
    fn from_payload(payload: Payload) -> Option<Self> {
        match payload {
            Payload::Value(value) => Some(value),
            _ => None,
        }
    }
}

impl FromPayload for i64 {
    fn from_payload(payload: Payload) -> Option<Self> {
        match payload {
            Payload::Integer(n) => Some(n),
            _ => None,
        }
    }
}

impl FromPayload for Vec<String> {
    fn from_payload(payload: Payload) -> Option<Self> {
        match payload {
            Payload::Keys(keys) => Some(keys),
            _ => None,
        }
    }
}

impl FromPayload for Vec<VersionInfo> {
    fn from_payload(payload: Payload) -> Option<Self> {
        match payload {
            Payload::Versions(versions) => Some(versions),
            _ => None,
        }
    }
}

impl FromPayload for Vec<SortedEntry> {
    fn from_payload(payload: Payload) -> Option<Self> {
        match payload {
            Payload::Sorted(entries) => Some(entries),
            _ => None,
        }
    }
}

/// Write operations carry no value; any payload is discarded.
impl FromPayload for () {
    fn from_payload(_: Payload) -> Option<Self> {
        Some(())
    }
}

/// Typed view of a [`RequestOutcome`] returned by the facade.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<T> {
    pub success: bool,
    pub error_message: Option<String>,
    pub value: Option<T>,
}

impl<T: FromPayload> From<RequestOutcome> for Outcome<T> {
    fn from(outcome: RequestOutcome) -> Self {
        let RequestOutcome {
            success,
            error_message,
            value,
        } = outcome;
        match value {
            None => Self {
                success,
                error_message,
                value: None,
            },
            Some(payload) => match T::from_payload(payload) {
                Some(value) => Self {
                    success,
                    error_message,
                    value: Some(value),
                },
                None => Self {
                    success: false,
                    error_message: Some("Backend returned an unexpected value shape".to_string()),
                    value: None,
                },
            },
        }
    }
}

impl<T> Outcome<T> {
    /// Converts into a `Result`, using the error message as the error.
    pub fn into_result(self) -> Result<Option<T>, String> {
        if self.success {
            Ok(self.value)
        } else {
            Err(self
                .error_message
                .unwrap_or_else(|| "Request failed".to_string()))
        }
    }
}
