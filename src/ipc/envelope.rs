//! IPC envelope formats.

use serde::{Deserialize, Serialize};

/// Name of the sentinel file asking a container to wind down.
pub const CLOSE_SENTINEL: &str = "_close";

/// Host → container message written to `input/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputEnvelope {
    Message { text: String },
}

/// Container → host file delivery request read from `files/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEnvelope {
    File(FileRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequest {
    pub chat_jid: String,
    /// Relative to the group folder, or under `/workspace/group/`.
    pub file_path: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

impl FileRequest {
    /// Name of the first required field that is empty.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.chat_jid.trim().is_empty() {
            Some("chatJid")
        } else if self.file_path.trim().is_empty() {
            Some("filePath")
        } else if self.filename.trim().is_empty() {
            Some("filename")
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_envelope_wire_format() {
        let json = serde_json::to_string(&InputEnvelope::Message {
            text: "hello".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"message","text":"hello"}"#);
    }

    #[test]
    fn file_request_parses_camel_case() {
        let env: OutboundEnvelope = serde_json::from_str(
            r#"{"type":"file","chatJid":"tg:1","filePath":"out/a.pdf","filename":"a.pdf","mimeType":"application/pdf"}"#,
        )
        .unwrap();
        let OutboundEnvelope::File(req) = env;
        assert_eq!(req.chat_jid, "tg:1");
        assert_eq!(req.mime_type.as_deref(), Some("application/pdf"));
        assert_eq!(req.caption, None);
        assert_eq!(req.missing_field(), None);
    }

    #[test]
    fn unknown_type_and_missing_fields_are_rejected() {
        assert!(serde_json::from_str::<OutboundEnvelope>(r#"{"type":"photo","chatJid":"x"}"#).is_err());
        assert!(serde_json::from_str::<OutboundEnvelope>(r#"{"type":"file","chatJid":"x"}"#).is_err());

        let env: OutboundEnvelope = serde_json::from_str(
            r#"{"type":"file","chatJid":"tg:1","filePath":"","filename":"a"}"#,
        )
        .unwrap();
        let OutboundEnvelope::File(req) = env;
        assert_eq!(req.missing_field(), Some("filePath"));
    }
}
