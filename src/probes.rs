use crate::models::{EndpointKind, EMPTY_RESPONSE_MSG, ERROR_CAPTURE_BYTES};
use serde_json::{json, Value};

// ============================================================
// Probe strategies: classification, request building, parsing
// ============================================================
//
// Pure functions only. Nothing in here performs I/O or returns an
// error across the worker boundary; a malformed upstream response is
// an outcome, not an exception.

/// A fully built probe request, ready for the executor.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Value,
}

/// Strip a single trailing `/` so path joins never double up.
pub fn normalize_base_url(base_url: &str) -> &str {
    base_url.strip_suffix('/').unwrap_or(base_url)
}

/// Map a model name to the endpoint kind it is natively served on.
///
/// Rules are evaluated in order, case-insensitively:
/// claude → gemini → codex (gpt-5.1/5.2 family) → image keywords → chat.
pub fn endpoint_kind_for(model_name: &str) -> EndpointKind {
    let name = model_name.to_lowercase();
    if name.contains("claude") {
        return EndpointKind::Claude;
    }
    if name.contains("gemini") {
        return EndpointKind::Gemini;
    }
    let codex = regex::Regex::new(r"^gpt-5\.(1|2)(\b|-)").unwrap();
    if codex.is_match(&name) {
        return EndpointKind::Codex;
    }
    const IMAGE_KEYWORDS: [&str; 6] = [
        "image",
        "dall-e",
        "imagen",
        "flux",
        "stable-diffusion",
        "midjourney",
    ];
    if IMAGE_KEYWORDS.iter().any(|kw| name.contains(kw)) {
        return EndpointKind::Image;
    }
    EndpointKind::Chat
}

/// Ordered, deduplicated list of kinds to probe for a model.
///
/// The native kind always comes first; with `chat_fallback` enabled,
/// non-chat models get a secondary plain chat completion probe.
pub fn endpoints_to_probe(model_name: &str, chat_fallback: bool) -> Vec<EndpointKind> {
    let native = endpoint_kind_for(model_name);
    let mut kinds = vec![native];
    if chat_fallback && native != EndpointKind::Chat {
        kinds.push(EndpointKind::Chat);
    }
    kinds
}

/// Build the minimal upstream request for one `(model, kind)` pair.
pub fn build_probe(
    base_url: &str,
    api_key: &str,
    model_name: &str,
    kind: EndpointKind,
) -> ProbeRequest {
    let base = normalize_base_url(base_url);
    match kind {
        EndpointKind::Chat => ProbeRequest {
            url: format!("{}/v1/chat/completions", base),
            headers: vec![("Authorization", format!("Bearer {}", api_key))],
            body: json!({
                "model": model_name,
                "messages": [{"role": "user", "content": "hi"}],
                "max_tokens": 1,
                "stream": false,
            }),
        },
        EndpointKind::Claude => ProbeRequest {
            url: format!("{}/v1/messages", base),
            headers: vec![
                ("x-api-key", api_key.to_string()),
                ("anthropic-version", "2023-06-01".to_string()),
            ],
            body: json!({
                "model": model_name,
                "max_tokens": 1,
                "messages": [{"role": "user", "content": "hi"}],
            }),
        },
        EndpointKind::Gemini => ProbeRequest {
            url: format!("{}/v1beta/models/{}:generateContent", base, model_name),
            headers: vec![("x-goog-api-key", api_key.to_string())],
            body: json!({
                "contents": [{"parts": [{"text": "hi"}]}],
            }),
        },
        EndpointKind::Codex => ProbeRequest {
            url: format!("{}/v1/responses", base),
            headers: vec![("Authorization", format!("Bearer {}", api_key))],
            body: json!({
                "model": model_name,
                "input": "hi",
            }),
        },
        EndpointKind::Image => ProbeRequest {
            url: format!("{}/v1/images/generations", base),
            headers: vec![("Authorization", format!("Bearer {}", api_key))],
            body: json!({
                "model": model_name,
                "prompt": "a cat",
                "n": 1,
                "size": "256x256",
            }),
        },
    }
}

/// Decide success/failure from an upstream status code and body.
///
/// Success requires 2xx *and* a non-empty kind-specific content field;
/// extra sibling fields in the envelope are ignored. Returns the error
/// message for failures.
pub fn parse_outcome(kind: EndpointKind, http_status: u16, body: &str) -> Result<(), String> {
    if !(200..300).contains(&http_status) {
        let trimmed = truncate_utf8(body.trim(), ERROR_CAPTURE_BYTES);
        if trimmed.is_empty() {
            return Err(format!("HTTP {}", http_status));
        }
        return Err(trimmed);
    }
    let value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return Err(EMPTY_RESPONSE_MSG.to_string()),
    };
    if extract_content(kind, &value).is_some() {
        Ok(())
    } else {
        Err(EMPTY_RESPONSE_MSG.to_string())
    }
}

/// The kind-specific content field, if present and non-empty.
fn extract_content(kind: EndpointKind, body: &Value) -> Option<&str> {
    let content = match kind {
        EndpointKind::Chat | EndpointKind::Codex => {
            body["choices"][0]["message"]["content"].as_str()
        }
        EndpointKind::Claude => body["content"][0]["text"].as_str(),
        EndpointKind::Gemini => body["candidates"][0]["content"]["parts"][0]["text"].as_str(),
        EndpointKind::Image => body["data"][0]["url"]
            .as_str()
            .or_else(|| body["data"][0]["b64_json"].as_str()),
    }?;
    if content.is_empty() {
        None
    } else {
        Some(content)
    }
}

/// Truncate to at most `max_bytes` without splitting a UTF-8 sequence.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    mod classification_tests {
        use super::*;

        #[test]
        fn claude_models_route_to_claude() {
            assert_eq!(endpoint_kind_for("claude-3-opus"), EndpointKind::Claude);
            assert_eq!(endpoint_kind_for("Claude-Sonnet"), EndpointKind::Claude);
        }

        #[test]
        fn gemini_models_route_to_gemini() {
            assert_eq!(endpoint_kind_for("gemini-pro"), EndpointKind::Gemini);
            assert_eq!(endpoint_kind_for("GEMINI-2.0-flash"), EndpointKind::Gemini);
        }

        #[test]
        fn claude_rule_wins_over_gemini_rule() {
            // Rules are ordered; a name containing both hits claude first
            assert_eq!(endpoint_kind_for("claude-gemini-hybrid"), EndpointKind::Claude);
        }

        #[test]
        fn codex_pattern_matches_gpt_five_one_and_two() {
            assert_eq!(endpoint_kind_for("gpt-5.1"), EndpointKind::Codex);
            assert_eq!(endpoint_kind_for("gpt-5.2-turbo"), EndpointKind::Codex);
        }

        #[test]
        fn codex_pattern_rejects_lookalikes() {
            // "gpt-5.10" has no word boundary after the 1
            assert_eq!(endpoint_kind_for("gpt-5.10"), EndpointKind::Chat);
            assert_eq!(endpoint_kind_for("gpt-5"), EndpointKind::Chat);
            assert_eq!(endpoint_kind_for("my-gpt-5.1"), EndpointKind::Chat);
        }

        #[test]
        fn image_keywords_route_to_image() {
            for name in [
                "dall-e-3",
                "imagen-3",
                "flux-dev",
                "stable-diffusion-xl",
                "midjourney-v6",
                "some-image-model",
            ] {
                assert_eq!(endpoint_kind_for(name), EndpointKind::Image, "{}", name);
            }
        }

        #[test]
        fn everything_else_routes_to_chat() {
            assert_eq!(endpoint_kind_for("gpt-4"), EndpointKind::Chat);
            assert_eq!(endpoint_kind_for("deepseek-v3"), EndpointKind::Chat);
            assert_eq!(endpoint_kind_for("qwen-max"), EndpointKind::Chat);
        }
    }

    mod endpoints_to_probe_tests {
        use super::*;

        #[test]
        fn default_is_single_native_kind() {
            assert_eq!(endpoints_to_probe("claude-3", false), vec![EndpointKind::Claude]);
            assert_eq!(endpoints_to_probe("gpt-4", false), vec![EndpointKind::Chat]);
        }

        #[test]
        fn chat_fallback_appends_chat_for_non_chat_models() {
            assert_eq!(
                endpoints_to_probe("gemini-pro", true),
                vec![EndpointKind::Gemini, EndpointKind::Chat]
            );
        }

        #[test]
        fn chat_fallback_never_duplicates_chat() {
            assert_eq!(endpoints_to_probe("gpt-4", true), vec![EndpointKind::Chat]);
        }
    }

    mod build_probe_tests {
        use super::*;

        #[test]
        fn chat_probe_shape() {
            let req = build_probe("https://api.example.test", "sk-ok", "gpt-4", EndpointKind::Chat);
            assert_eq!(req.url, "https://api.example.test/v1/chat/completions");
            assert_eq!(req.headers, vec![("Authorization", "Bearer sk-ok".to_string())]);
            assert_eq!(req.body["model"], "gpt-4");
            assert_eq!(req.body["max_tokens"], 1);
            assert_eq!(req.body["stream"], false);
        }

        #[test]
        fn claude_probe_uses_api_key_header_and_version() {
            let req = build_probe("https://api.example.test", "sk-ant", "claude-3", EndpointKind::Claude);
            assert_eq!(req.url, "https://api.example.test/v1/messages");
            assert!(req.headers.contains(&("x-api-key", "sk-ant".to_string())));
            assert!(req
                .headers
                .contains(&("anthropic-version", "2023-06-01".to_string())));
        }

        #[test]
        fn gemini_probe_embeds_model_in_path() {
            let req = build_probe("https://g.example.test", "gk", "gemini-pro", EndpointKind::Gemini);
            assert_eq!(
                req.url,
                "https://g.example.test/v1beta/models/gemini-pro:generateContent"
            );
            assert!(req.headers.contains(&("x-goog-api-key", "gk".to_string())));
            assert_eq!(req.body["contents"][0]["parts"][0]["text"], "hi");
        }

        #[test]
        fn codex_probe_hits_responses_endpoint() {
            let req = build_probe("https://api.example.test", "sk", "gpt-5.1", EndpointKind::Codex);
            assert_eq!(req.url, "https://api.example.test/v1/responses");
            assert_eq!(req.body["input"], "hi");
        }

        #[test]
        fn image_probe_shape() {
            let req = build_probe("https://api.example.test", "sk", "dall-e-3", EndpointKind::Image);
            assert_eq!(req.url, "https://api.example.test/v1/images/generations");
            assert_eq!(req.body["prompt"], "a cat");
            assert_eq!(req.body["size"], "256x256");
        }

        #[test]
        fn trailing_slash_is_stripped_once() {
            let req = build_probe("https://api.example.test/", "sk", "gpt-4", EndpointKind::Chat);
            assert_eq!(req.url, "https://api.example.test/v1/chat/completions");
        }
    }

    mod parse_outcome_tests {
        use super::*;

        #[test]
        fn chat_success_requires_message_content() {
            let body = r#"{"choices":[{"message":{"content":"hi"}}]}"#;
            assert!(parse_outcome(EndpointKind::Chat, 200, body).is_ok());
        }

        #[test]
        fn extra_envelope_fields_are_ignored() {
            let body = r#"{"ok":true,"wrapper":1,"choices":[{"message":{"content":"hi"}}],"usage":{}}"#;
            assert!(parse_outcome(EndpointKind::Chat, 200, body).is_ok());
        }

        #[test]
        fn empty_content_is_a_failure() {
            let body = r#"{"choices":[{"message":{"content":""}}]}"#;
            let err = parse_outcome(EndpointKind::Chat, 200, body).unwrap_err();
            assert_eq!(err, EMPTY_RESPONSE_MSG);
        }

        #[test]
        fn non_json_2xx_is_a_failure() {
            let err = parse_outcome(EndpointKind::Chat, 200, "<html>ok</html>").unwrap_err();
            assert_eq!(err, EMPTY_RESPONSE_MSG);
        }

        #[test]
        fn claude_success_reads_content_text() {
            let body = r#"{"content":[{"type":"text","text":"hi"}],"stop_reason":"end_turn"}"#;
            assert!(parse_outcome(EndpointKind::Claude, 200, body).is_ok());
        }

        #[test]
        fn gemini_success_reads_candidate_text() {
            let body = r#"{"candidates":[{"content":{"parts":[{"text":"hi"}]}}]}"#;
            assert!(parse_outcome(EndpointKind::Gemini, 200, body).is_ok());
        }

        #[test]
        fn codex_parses_like_chat() {
            let body = r#"{"choices":[{"message":{"content":"hi"}}]}"#;
            assert!(parse_outcome(EndpointKind::Codex, 200, body).is_ok());
        }

        #[test]
        fn image_accepts_url_or_b64() {
            let url_body = r#"{"data":[{"url":"https://cdn.example.test/cat.png"}]}"#;
            let b64_body = r#"{"data":[{"b64_json":"aGVsbG8="}]}"#;
            assert!(parse_outcome(EndpointKind::Image, 200, url_body).is_ok());
            assert!(parse_outcome(EndpointKind::Image, 200, b64_body).is_ok());
        }

        #[test]
        fn non_2xx_captures_truncated_body() {
            let body = "x".repeat(2000);
            let err = parse_outcome(EndpointKind::Chat, 500, &body).unwrap_err();
            assert_eq!(err.len(), ERROR_CAPTURE_BYTES);
        }

        #[test]
        fn non_2xx_with_empty_body_reports_status() {
            let err = parse_outcome(EndpointKind::Chat, 503, "").unwrap_err();
            assert_eq!(err, "HTTP 503");
        }

        #[test]
        fn status_299_is_still_success() {
            let body = r#"{"choices":[{"message":{"content":"hi"}}]}"#;
            assert!(parse_outcome(EndpointKind::Chat, 299, body).is_ok());
            assert!(parse_outcome(EndpointKind::Chat, 300, body).is_err());
        }
    }

    mod truncate_tests {
        use super::*;

        #[test]
        fn short_strings_pass_through() {
            assert_eq!(truncate_utf8("hello", 10), "hello");
        }

        #[test]
        fn truncation_respects_char_boundaries() {
            let s = "héllo wörld";
            let out = truncate_utf8(s, 2);
            assert!(out.len() <= 2);
            assert!(s.starts_with(&out));
        }
    }
}
