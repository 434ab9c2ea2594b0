use serde_json::Value;
use strata_types::TokenUsage;

/// Appends raw bytes to the frame buffer and drains every complete frame,
/// returning the `data:` payloads in arrival order. Bytes are buffered until a
/// frame completes so multi-byte characters split across chunks survive.
pub(crate) fn drain_sse_payloads(buffer: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
    let mut payloads = Vec::new();
    while let Some(pos) = buffer.windows(2).position(|w| w == b"\n\n") {
        let frame = buffer.drain(..pos + 2).collect::<Vec<u8>>();
        let frame = String::from_utf8_lossy(&frame[..pos]);
        for line in frame.lines() {
            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();
            if !payload.is_empty() {
                payloads.push(payload.to_string());
            }
        }
    }
    payloads
}

pub(crate) fn normalize_base(input: &str) -> String {
    if input.ends_with("/v1") {
        input.trim_end_matches('/').to_string()
    } else {
        format!("{}/v1", input.trim_end_matches('/'))
    }
}

pub(crate) fn normalize_plain_base(input: &str) -> String {
    input.trim_end_matches('/').to_string()
}

pub(crate) fn extract_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage").filter(|u| u.is_object())?;
    let prompt_tokens = usage
        .get("prompt_tokens")
        .or_else(|| usage.get("input_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .or_else(|| usage.get("output_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

pub(crate) fn extract_error_message(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}
