//! JSON envelopes and shared human-readable formatting.

use anyhow::Result;
use serde::Serialize;
use serde_json::json;

const SCHEMA_VERSION: &str = "1.0";

/// Wrapper around every `--json` payload.
#[derive(Debug, Serialize)]
pub struct Envelope<'a, T: Serialize> {
    #[serde(rename = "$schema")]
    pub schema: String,
    #[serde(rename = "_schema_version")]
    pub schema_version: &'static str,
    pub success: bool,
    pub data: &'a T,
}

impl<'a, T: Serialize> Envelope<'a, T> {
    pub fn new(kind: &str, data: &'a T) -> Self {
        Self {
            schema: format!("ensemble://{kind}/v1"),
            schema_version: SCHEMA_VERSION,
            success: true,
            data,
        }
    }
}

/// Print `data` as an envelope, or run `human` for text output.
pub fn emit<T, F>(json_mode: bool, kind: &str, data: &T, human: F) -> Result<()>
where
    T: Serialize,
    F: FnOnce(&T),
{
    if json_mode {
        println!("{}", serde_json::to_string_pretty(&Envelope::new(kind, data))?);
    } else {
        human(data);
    }
    Ok(())
}

/// Error envelope for `--json` mode. Returns the exit code it reports.
pub fn output_json_error(err: &anyhow::Error) -> i32 {
    let exit_code = super::exit_code(err);
    let kind = err
        .downcast_ref::<ensemble_core::Error>()
        .map_or("INTERNAL", error_kind);
    let envelope = json!({
        "$schema": "ensemble://error-response/v1",
        "_schema_version": SCHEMA_VERSION,
        "success": false,
        "error": {
            "kind": kind,
            "message": err.to_string(),
            "exit_code": exit_code,
        },
    });
    match serde_json::to_string_pretty(&envelope) {
        Ok(text) => println!("{text}"),
        Err(_) => println!(r#"{{"success":false,"error":{{"exit_code":{exit_code}}}}}"#),
    }
    exit_code
}

const fn error_kind(err: &ensemble_core::Error) -> &'static str {
    use ensemble_core::Error;
    match err {
        Error::LockHeld { .. } => "LOCK_HELD",
        Error::NotLockHolder { .. } => "NOT_LOCK_HOLDER",
        Error::InvalidTransition { .. } => "INVALID_TRANSITION",
        Error::VerificationRequired { .. } => "VERIFICATION_REQUIRED",
        Error::InvalidResource { .. } => "INVALID_RESOURCE",
        Error::NotFound { .. } => "NOT_FOUND",
        Error::InvalidInput(_) => "INVALID_INPUT",
        Error::InvalidConfig(_) => "INVALID_CONFIG",
        Error::Io { .. } => "IO",
        Error::Serialization { .. } => "SERIALIZATION",
        Error::WorkspaceUnavailable { .. } => "WORKSPACE_UNAVAILABLE",
    }
}

/// `1234` seconds as `20m34s`.
pub fn format_age(secs: i64) -> String {
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3_600 => format!("{}m{:02}s", s / 60, s % 60),
        s => format!("{}h{:02}m", s / 3_600, (s % 3_600) / 60),
    }
}

/// First line of `text`, cut to `max` characters.
pub fn preview(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > max {
        let cut: String = line.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}
