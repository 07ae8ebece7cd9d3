//! Webhook dispatch.
//!
//! After a mutating command, the actions recorded since the command's
//! pre-run timestamp are packaged into a payload, written to a temp file,
//! and handed to a detached `td webhook-send` child. The child is the only
//! component that performs the POST (and cleans the temp file up), so the
//! parent command returns without waiting on the network.

use std::path::Path;
use std::process::Stdio;

use chrono::{DateTime, Utc};
use ring::hmac;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use td_store::ActionEntry;

pub const SIGNATURE_HEADER: &str = "X-TD-Signature";

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAction {
    pub id: String,
    pub action_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub previous_data: Option<Value>,
    pub new_data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub timestamp: DateTime<Utc>,
    pub project: String,
    pub actions: Vec<WebhookAction>,
}

impl WebhookPayload {
    pub fn from_actions(project: &str, actions: &[ActionEntry]) -> Self {
        Self {
            timestamp: Utc::now(),
            project: project.to_string(),
            actions: actions
                .iter()
                .map(|a| WebhookAction {
                    id: a.id.clone(),
                    action_type: a.action_type.as_str().to_string(),
                    entity_type: a.entity_type.clone(),
                    entity_id: a.entity_id.clone(),
                    previous_data: a.previous_data.clone(),
                    new_data: a.new_data.clone(),
                    timestamp: a.timestamp,
                })
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// `sha256=<hex>` HMAC over the raw request body.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let tag = hmac::sign(&key, body);
    format!("sha256={}", hex(tag.as_ref()))
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Verify a received signature (for webhook consumers and tests).
/// Malformed signatures are rejected outright; tag comparison happens in
/// constant time inside `ring`.
pub fn verify(secret: &str, body: &[u8], signature: &str) -> bool {
    let Some(hex_tag) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Some(tag) = unhex(hex_tag) else {
        return false;
    };
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hmac::verify(&key, body, &tag).is_ok()
}

fn unhex(s: &str) -> Option<Vec<u8>> {
    if s.is_empty() || s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Write the payload to a temp file and spawn the detached sender child.
/// Fire-and-forget: the child owns delivery and temp-file cleanup.
pub fn dispatch_detached(
    payload: &WebhookPayload,
    url: &str,
    secret: Option<&str>,
) -> std::io::Result<()> {
    let path = std::env::temp_dir().join(format!("td-webhook-{}.json", Uuid::new_v4()));
    let body = serde_json::to_vec(payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(&path, &body)?;

    let exe = std::env::current_exe()?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("webhook-send")
        .arg("--file")
        .arg(&path)
        .arg("--url")
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(secret) = secret {
        cmd.arg("--secret").arg(secret);
    }
    let child = cmd.spawn()?;
    tracing::debug!(pid = child.id(), path = %path.display(), "webhook child spawned");
    Ok(())
}

/// The child side: read the payload file, POST it (signed when a secret is
/// configured), and remove the file regardless of outcome.
pub async fn send_from_file(
    path: &Path,
    url: &str,
    secret: Option<&str>,
) -> Result<(), String> {
    let body = std::fs::read(path).map_err(|e| e.to_string())?;
    let result = post_payload(url, &body, secret).await;
    let _ = std::fs::remove_file(path);
    result
}

async fn post_payload(url: &str, body: &[u8], secret: Option<&str>) -> Result<(), String> {
    let client = reqwest::Client::new();
    let mut req = client
        .post(url)
        .header("content-type", "application/json")
        .body(body.to_vec());
    if let Some(secret) = secret {
        req = req.header(SIGNATURE_HEADER, sign(secret, body));
    }
    let response = req.send().await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("webhook endpoint returned {}", response.status()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use td_store::ActionType;

    fn entry() -> ActionEntry {
        ActionEntry {
            rowid: 1,
            id: "a1".into(),
            session_id: "s1".into(),
            action_type: ActionType::Close,
            entity_type: "issues".into(),
            entity_id: "td-1".into(),
            previous_data: Some(serde_json::json!({"status": "in_review"})),
            new_data: Some(serde_json::json!({"status": "closed"})),
            timestamp: Utc::now(),
            undone: false,
            synced_at: None,
            server_seq: None,
        }
    }

    #[test]
    fn payload_carries_domain_verbs() {
        let payload = WebhookPayload::from_actions("proj", &[entry()]);
        assert_eq!(payload.project, "proj");
        assert_eq!(payload.actions.len(), 1);
        // The webhook keeps the domain verb; only the sync wire collapses it.
        assert_eq!(payload.actions[0].action_type, "close");
    }

    #[test]
    fn signature_round_trips() {
        let body = br#"{"timestamp":"t","project":"p","actions":[]}"#;
        let signature = sign("secret", body);
        assert!(signature.starts_with("sha256="));
        assert_eq!(signature.len(), "sha256=".len() + 64);
        assert!(verify("secret", body, &signature));
        assert!(!verify("other", body, &signature));
        assert!(!verify("secret", b"tampered", &signature));
        assert!(!verify("secret", body, "md5=nope"));
    }

    #[test]
    fn malformed_signatures_are_rejected() {
        let body = b"payload";
        assert!(!verify("secret", body, "sha256="));
        assert!(!verify("secret", body, "sha256=zz"));
        assert!(!verify("secret", body, "sha256=abc")); // odd length
        assert!(!verify("secret", body, "sha256=abcd")); // wrong tag length
        // Hex case does not matter once decoded.
        let signature = sign("secret", body).to_ascii_uppercase();
        assert!(verify("secret", body, &format!("sha256={}", &signature["SHA256=".len()..])));
    }

    #[test]
    fn signature_is_deterministic() {
        let body = b"payload";
        assert_eq!(sign("k", body), sign("k", body));
        assert_ne!(sign("k", body), sign("k2", body));
    }

    #[test]
    fn payload_json_shape() {
        let payload = WebhookPayload::from_actions("proj", &[entry()]);
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("timestamp").is_some());
        assert!(json.get("project").is_some());
        let action = &json["actions"][0];
        for key in ["id", "action_type", "entity_type", "entity_id", "previous_data", "new_data", "timestamp"] {
            assert!(action.get(key).is_some(), "missing {key}");
        }
    }
}
