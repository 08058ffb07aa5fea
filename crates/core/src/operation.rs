//! Operation types: the actions the model can request.
//!
//! The set of operation kinds is closed: a model-issued name either parses
//! into an [`OperationKind`] or is rejected at the boundary with
//! [`OperationError::Unsupported`]. Each kind is served by one
//! [`OperationHandler`] registered with the dispatcher.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::OperationError;
use crate::identity::IdentityPartition;
use crate::message::MessageOperationCall;
use crate::model::OperationSpec;

/// Every action type the runtime knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    EndTurn,
    KnowledgeSearch,
    WebSearch,
    SendEmail,
    ReadEmail,
    ListCalendarEvents,
    CreateCalendarEvent,
    ReadFile,
    UploadFile,
    ReadSpreadsheet,
    UpdateSpreadsheet,
    PlaceCall,
    SendSms,
    CreateIssue,
}

impl OperationKind {
    pub const ALL: [OperationKind; 14] = [
        Self::EndTurn,
        Self::KnowledgeSearch,
        Self::WebSearch,
        Self::SendEmail,
        Self::ReadEmail,
        Self::ListCalendarEvents,
        Self::CreateCalendarEvent,
        Self::ReadFile,
        Self::UploadFile,
        Self::ReadSpreadsheet,
        Self::UpdateSpreadsheet,
        Self::PlaceCall,
        Self::SendSms,
        Self::CreateIssue,
    ];

    /// Wire name, as advertised to the model.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::KnowledgeSearch => "knowledge_search",
            Self::WebSearch => "web_search",
            Self::SendEmail => "send_email",
            Self::ReadEmail => "read_email",
            Self::ListCalendarEvents => "list_calendar_events",
            Self::CreateCalendarEvent => "create_calendar_event",
            Self::ReadFile => "read_file",
            Self::UploadFile => "upload_file",
            Self::ReadSpreadsheet => "read_spreadsheet",
            Self::UpdateSpreadsheet => "update_spreadsheet",
            Self::PlaceCall => "place_call",
            Self::SendSms => "send_sms",
            Self::CreateIssue => "create_issue",
        }
    }

    /// Default description sent to the model.
    pub fn description(self) -> &'static str {
        match self {
            Self::EndTurn => "Finish the current turn once the user's request is fully handled.",
            Self::KnowledgeSearch => "Search the user's ingested documents for relevant passages.",
            Self::WebSearch => "Search the web and return result titles, URLs and snippets.",
            Self::SendEmail => "Send an email on the user's behalf.",
            Self::ReadEmail => "Read recent emails from the user's mailbox.",
            Self::ListCalendarEvents => "List calendar events in a time range.",
            Self::CreateCalendarEvent => "Create a calendar event.",
            Self::ReadFile => "Read a file from the user's storage.",
            Self::UploadFile => "Upload a file to the user's storage.",
            Self::ReadSpreadsheet => "Read a range of cells from a spreadsheet.",
            Self::UpdateSpreadsheet => "Write values into a range of spreadsheet cells.",
            Self::PlaceCall => "Place a phone call.",
            Self::SendSms => "Send a text message.",
            Self::CreateIssue => "Open an issue in a code hosting repository.",
        }
    }

    /// Whether a successful execution changes state outside the runtime.
    pub fn is_side_effecting(self) -> bool {
        matches!(
            self,
            Self::SendEmail
                | Self::CreateCalendarEvent
                | Self::UploadFile
                | Self::UpdateSpreadsheet
                | Self::PlaceCall
                | Self::SendSms
                | Self::CreateIssue
        )
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = OperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| OperationError::Unsupported { kind: s.to_string() })
    }
}

/// A checked request to execute one operation. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Unique within the turn
    pub id: String,

    /// Round that issued this request (0-based)
    pub iteration_index: u32,

    pub kind: OperationKind,

    pub parameters: serde_json::Map<String, serde_json::Value>,

    /// Advisory ordering hint; execution order is request order
    #[serde(default)]
    pub priority: i32,
}

impl OperationRequest {
    /// Validate a model-issued call into a request.
    ///
    /// `id` is the turn-unique id chosen by the orchestrator. Empty
    /// arguments are an empty parameter map; anything that isn't a JSON
    /// object is rejected.
    pub fn from_call(
        call: &MessageOperationCall,
        id: impl Into<String>,
        iteration_index: u32,
    ) -> Result<Self, OperationError> {
        let kind: OperationKind = call.name.parse()?;
        let raw = call.arguments.trim();
        let parameters = if raw.is_empty() {
            serde_json::Map::new()
        } else {
            match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(serde_json::Value::Object(map)) => map,
                Ok(other) => {
                    return Err(OperationError::InvalidParameters {
                        kind: kind.to_string(),
                        reason: format!("expected a JSON object, got {other}"),
                    });
                }
                Err(e) => {
                    return Err(OperationError::InvalidParameters {
                        kind: kind.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        };

        Ok(Self {
            id: id.into(),
            iteration_index,
            kind,
            parameters,
            priority: call.priority,
        })
    }

    /// Fetch a required string parameter.
    pub fn required_str(&self, key: &str) -> Result<&str, OperationError> {
        self.parameters
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| OperationError::InvalidParameters {
                kind: self.kind.to_string(),
                reason: format!("missing '{key}' parameter"),
            })
    }
}

/// Context an operation executes in.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub turn_id: String,
    pub identity: IdentityPartition,
}

/// The successful output of a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationOutput {
    pub payload: serde_json::Value,
}

impl OperationOutput {
    pub fn json(payload: serde_json::Value) -> Self {
        Self { payload }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            payload: serde_json::Value::String(text.into()),
        }
    }
}

/// Structured failure inside an [`OperationResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationFailure {
    pub code: String,
    pub message: String,
}

/// The normalized outcome of one request. Exactly one per issued request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub request_id: String,

    /// Wire name of the kind as issued by the model
    pub kind: String,

    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationFailure>,

    #[serde(default)]
    pub duration_ms: u64,
}

impl OperationResult {
    pub fn succeeded(
        request_id: impl Into<String>,
        kind: impl Into<String>,
        output: OperationOutput,
        duration_ms: u64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            kind: kind.into(),
            success: true,
            payload: Some(output.payload),
            error: None,
            duration_ms,
        }
    }

    pub fn failed(
        request_id: impl Into<String>,
        kind: impl Into<String>,
        error: &OperationError,
        duration_ms: u64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            kind: kind.into(),
            success: false,
            payload: None,
            error: Some(OperationFailure {
                code: error.code().to_string(),
                message: error.to_string(),
            }),
            duration_ms,
        }
    }

    /// Parsed kind, if the model issued a known one.
    pub fn operation_kind(&self) -> Option<OperationKind> {
        self.kind.parse().ok()
    }
}

/// A handler for one operation kind: the capability interface of an
/// external collaborator (mail, calendar, storage, ...).
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// The kind this handler serves.
    fn kind(&self) -> OperationKind;

    /// Description sent to the model.
    fn description(&self) -> &str {
        self.kind().description()
    }

    /// JSON Schema describing this handler's parameters.
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    /// Execute the request.
    async fn handle(
        &self,
        context: &OperationContext,
        request: &OperationRequest,
    ) -> Result<OperationOutput, OperationError>;

    /// Convert this handler into an [`OperationSpec`] for the model request.
    fn to_spec(&self) -> OperationSpec {
        OperationSpec {
            name: self.kind().as_str().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, arguments: &str) -> MessageOperationCall {
        MessageOperationCall {
            id: "c1".into(),
            name: name.into(),
            arguments: arguments.into(),
            priority: 0,
        }
    }

    #[test]
    fn kind_names_round_trip_through_from_str() {
        for kind in OperationKind::ALL {
            assert_eq!(kind.as_str().parse::<OperationKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_kind_is_unsupported() {
        let err = "launch_rocket".parse::<OperationKind>().unwrap_err();
        assert!(matches!(err, OperationError::Unsupported { ref kind } if kind == "launch_rocket"));
    }

    #[test]
    fn serde_name_matches_wire_name() {
        let json = serde_json::to_string(&OperationKind::CreateCalendarEvent).unwrap();
        assert_eq!(json, r#""create_calendar_event""#);
    }

    #[test]
    fn from_call_parses_object_arguments() {
        let req =
            OperationRequest::from_call(&call("send_email", r#"{"to":"a@b.c"}"#), "op_0_0", 0)
                .unwrap();
        assert_eq!(req.kind, OperationKind::SendEmail);
        assert_eq!(req.required_str("to").unwrap(), "a@b.c");
        assert!(req.required_str("subject").is_err());
    }

    #[test]
    fn from_call_accepts_empty_arguments() {
        let req = OperationRequest::from_call(&call("end_turn", ""), "op", 3).unwrap();
        assert!(req.parameters.is_empty());
        assert_eq!(req.iteration_index, 3);
    }

    #[test]
    fn from_call_rejects_non_object_arguments() {
        let err = OperationRequest::from_call(&call("web_search", "[1,2]"), "op", 0).unwrap_err();
        assert_eq!(err.code(), "invalid_parameters");
        let err = OperationRequest::from_call(&call("web_search", "{nope"), "op", 0).unwrap_err();
        assert_eq!(err.code(), "invalid_parameters");
    }

    #[test]
    fn failed_result_carries_code_and_message() {
        let err = OperationError::Unsupported { kind: "x".into() };
        let result = OperationResult::failed("op", "x", &err, 0);
        assert!(!result.success);
        let failure = result.error.unwrap();
        assert_eq!(failure.code, "unsupported_operation");
        assert!(failure.message.contains('x'));
    }

    #[test]
    fn side_effecting_kinds() {
        assert!(OperationKind::SendEmail.is_side_effecting());
        assert!(!OperationKind::KnowledgeSearch.is_side_effecting());
        assert!(!OperationKind::EndTurn.is_side_effecting());
    }
}
