use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::Utc;
use serde::Serialize;

use crate::{
    domain::{GroupMutationRequest, Jid},
    formatting::truncate_text,
    Result,
};

const AUDIT_MAX_TEXT: usize = 500;

/// RFC3339 timestamp in UTC.
pub fn iso_timestamp_utc() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEvent {
    fn empty(event: &str) -> Self {
        Self {
            timestamp: iso_timestamp_utc(),
            event: event.to_string(),
            conversation: None,
            command: None,
            group: None,
            participant: None,
            role: None,
            ok: None,
            error: None,
        }
    }

    pub fn command(from: &Jid, command: &str) -> Self {
        Self {
            conversation: Some(from.to_string()),
            command: Some(truncate_text(command, AUDIT_MAX_TEXT)),
            ..Self::empty("command")
        }
    }

    pub fn mutation(req: &GroupMutationRequest, error: Option<&str>) -> Self {
        Self {
            group: Some(req.group.to_string()),
            participant: Some(req.participant.to_string()),
            role: Some(req.role.as_str().to_string()),
            ok: Some(error.is_none()),
            error: error.map(|s| truncate_text(s, AUDIT_MAX_TEXT)),
            ..Self::empty("group_mutation")
        }
    }

    /// `<timestamp> <event> key=value ...` for the fields that are set.
    fn text_line(&self) -> String {
        let ok = self.ok.map(|b| b.to_string());
        let fields = [
            ("conversation", self.conversation.as_deref()),
            ("command", self.command.as_deref()),
            ("group", self.group.as_deref()),
            ("participant", self.participant.as_deref()),
            ("role", self.role.as_deref()),
            ("ok", ok.as_deref()),
            ("error", self.error.as_deref()),
        ];
        let mut out = format!("{} {}", self.timestamp, self.event);
        for (key, value) in fields {
            if let Some(value) = value {
                out.push_str(&format!(" {key}={value}"));
            }
        }
        out
    }
}

/// Appends one line per event, as JSON or as `key=value` text.
#[derive(Clone, Debug)]
pub struct AuditLogger {
    path: PathBuf,
    json: bool,
}

impl AuditLogger {
    pub fn new(path: impl Into<PathBuf>, json: bool) -> Self {
        Self {
            path: path.into(),
            json,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, event: AuditEvent) -> Result<()> {
        let mut line = if self.json {
            serde_json::to_string(&event)?
        } else {
            event.text_line()
        };
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}
