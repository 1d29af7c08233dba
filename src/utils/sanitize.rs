use serde_json::Value;

/// Masks sensitive fields in JSON payloads before they are logged.
pub fn sanitize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sanitized = serde_json::Map::new();
            for (key, val) in map {
                let sanitized_val = if is_sensitive_field(key) {
                    mask_value(val)
                } else {
                    sanitize_json(val)
                };
                sanitized.insert(key.clone(), sanitized_val);
            }
            Value::Object(sanitized)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sanitize_json).collect()),
        _ => value.clone(),
    }
}

fn is_sensitive_field(key: &str) -> bool {
    matches!(
        key.to_lowercase().as_str(),
        "account"
            | "account_id"
            | "destination"
            | "destination_account"
            | "payment_intent"
            | "payment_reference"
            | "client_secret"
            | "signature"
            | "stripe-signature"
            | "password"
            | "secret"
            | "token"
            | "api_key"
            | "authorization"
    )
}

fn mask_value(value: &Value) -> Value {
    match value {
        Value::String(s) if s.chars().count() > 8 => {
            let chars: Vec<char> = s.chars().collect();
            let start: String = chars[..4].iter().collect();
            let end: String = chars[chars.len() - 4..].iter().collect();
            Value::String(format!("{}****{}", start, end))
        }
        _ => Value::String("****".to_string()),
    }
}

/// Sanitizes a raw body for logging; non-JSON bodies are summarized.
pub fn sanitize_body(bytes: &[u8]) -> String {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(json) => serde_json::to_string(&sanitize_json(&json)).unwrap_or_else(|_| "[invalid json]".to_string()),
        Err(_) => format!("[non-json, {} bytes]", bytes.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_destination_account() {
        let input = json!({
            "destination": "acct_1NXYZabcdefghijkl",
            "amount": "91.80"
        });

        let sanitized = sanitize_json(&input);
        let destination = sanitized["destination"].as_str().unwrap();

        assert_eq!(destination, "acct****ijkl");
        assert_eq!(sanitized["amount"], "91.80");
    }

    #[test]
    fn test_sanitize_nested_event_object() {
        let input = json!({
            "data": {
                "object": {
                    "payment_intent": "pi_3NabcdefGHIJ",
                    "status": "succeeded"
                }
            }
        });

        let sanitized = sanitize_json(&input);
        assert!(sanitized["data"]["object"]["payment_intent"]
            .as_str()
            .unwrap()
            .contains("****"));
        assert_eq!(sanitized["data"]["object"]["status"], "succeeded");
    }

    #[test]
    fn test_short_and_non_string_values_fully_masked() {
        let input = json!({ "secret": "abc", "token": 12345 });
        let sanitized = sanitize_json(&input);
        assert_eq!(sanitized["secret"], "****");
        assert_eq!(sanitized["token"], "****");
    }

    #[test]
    fn test_non_json_body_is_summarized() {
        assert_eq!(sanitize_body(b"t=1,v1=abc"), "[non-json, 10 bytes]");
    }
}
