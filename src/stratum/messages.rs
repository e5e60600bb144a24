// src/stratum/messages.rs
//! Stratum wire messages
//!
//! Requests are JSON objects with a monotonically increasing integer `id`;
//! replies correlate by that id. Notifications carry a `method` and no id
//! worth tracking. Everything travels as one JSON object per `\n`-terminated
//! line, UTF-8, no byte-order mark.

use serde_json::{Value, json};

/// Builds the `mining.subscribe` request line
pub fn subscribe(id: u64) -> String {
    line(json!({
        "id": id,
        "method": "mining.subscribe",
        "params": [format!("oremill/{}", env!("CARGO_PKG_VERSION"))]
    }))
}

/// Builds the `mining.authorize` request line
pub fn authorize(id: u64, user: &str, pass: &str) -> String {
    line(json!({
        "id": id,
        "method": "mining.authorize",
        "params": [user, pass]
    }))
}

/// Builds the `mining.submit` request line
///
/// All numeric params travel as fixed-width hex strings.
pub fn submit(id: u64, user: &str, job_id: &str, nonce2: &str, ntime: u32, nonce: u32) -> String {
    line(json!({
        "id": id,
        "method": "mining.submit",
        "params": [user, job_id, nonce2, format!("{:08x}", ntime), format!("{:08x}", nonce)]
    }))
}

fn line(value: Value) -> String {
    let mut text = value.to_string();
    text.push('\n');
    text
}

/// The `method` of a notification or server-side request
pub fn method(message: &Value) -> Option<&str> {
    message.get("method").and_then(Value::as_str)
}

/// The request id a reply correlates to, when present and non-null
pub fn reply_id(message: &Value) -> Option<u64> {
    message.get("id").and_then(Value::as_u64)
}

/// The params array of a notification
pub fn params(message: &Value) -> Option<&Vec<Value>> {
    message.get("params").and_then(Value::as_array)
}

/// Whether a reply's result converts to boolean true
pub fn bool_result(message: &Value) -> bool {
    match message.get("result") {
        Some(Value::Bool(flag)) => *flag,
        _ => false,
    }
}

/// The error member of a rejecting reply: `[code, message, traceback?]`
pub fn error_parts(message: &Value) -> Option<(i64, String)> {
    let error = message.get("error")?;
    if error.is_null() {
        return None;
    }
    let parts = error.as_array()?;
    let code = parts.first().and_then(Value::as_i64).unwrap_or(0);
    let text = parts
        .get(1)
        .and_then(Value::as_str)
        .unwrap_or("unspecified error")
        .to_string();
    Some((code, text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_newline_terminated_single_lines() {
        for text in [
            subscribe(1),
            authorize(2, "wallet.w1", "x"),
            submit(3, "wallet.w1", "job9", "0000000a", 0x5c2a1b00, 0xdeadbeef),
        ] {
            assert!(text.ends_with('\n'));
            assert_eq!(text.matches('\n').count(), 1);
            let parsed: Value = serde_json::from_str(text.trim_end()).unwrap();
            assert!(parsed.get("id").is_some());
        }
    }

    #[test]
    fn submit_encodes_hex_fields() {
        let text = submit(7, "u", "j", "000000ff", 0x11223344, 0xa1b2c3d4);
        let parsed: Value = serde_json::from_str(text.trim_end()).unwrap();
        let params = params(&parsed).unwrap();
        assert_eq!(params[2], "000000ff");
        assert_eq!(params[3], "11223344");
        assert_eq!(params[4], "a1b2c3d4");
    }

    #[test]
    fn error_parts_reads_the_reject_tuple() {
        let reply: Value =
            serde_json::from_str(r#"{"id":3,"result":false,"error":[23,"low difficulty",null]}"#)
                .unwrap();
        assert!(!bool_result(&reply));
        let (code, text) = error_parts(&reply).unwrap();
        assert_eq!(code, 23);
        assert_eq!(text, "low difficulty");

        let ok: Value = serde_json::from_str(r#"{"id":3,"result":true,"error":null}"#).unwrap();
        assert!(error_parts(&ok).is_none());
    }
}
