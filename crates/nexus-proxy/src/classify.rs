use nexus_types::RequestType;
use serde_json::Value;

/// Classifies an inbound body into `{inference, query_evaluation, quota,
/// other}` from its shape alone (spec §4.5 step 2). Only `inference`
/// requests participate in conversation linking.
pub fn classify(path: &str, body: &Value) -> RequestType {
    let has_messages = body.get("messages").map(Value::is_array).unwrap_or(false);
    let has_max_tokens = body.get("max_tokens").is_some();
    let has_system = body.get("system").is_some();

    if path.contains("count_tokens") {
        return RequestType::QueryEvaluation;
    }

    if has_messages && has_max_tokens {
        return RequestType::Inference;
    }

    if has_messages && !has_max_tokens {
        // A messages array without a token budget is the shape used by
        // evaluation/dry-run calls (e.g. system-prompt fitting checks).
        return RequestType::QueryEvaluation;
    }

    if !has_messages && !has_system && body.as_object().map(|o| o.is_empty()).unwrap_or(true) {
        return RequestType::Quota;
    }

    RequestType::Other
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messages_with_max_tokens_is_inference() {
        let body = json!({"messages": [{"role": "user", "content": "hi"}], "max_tokens": 1024});
        assert_eq!(classify("/v1/messages", &body), RequestType::Inference);
    }

    #[test]
    fn messages_without_max_tokens_is_query_evaluation() {
        let body = json!({"messages": [{"role": "user", "content": "hi"}]});
        assert_eq!(classify("/v1/messages", &body), RequestType::QueryEvaluation);
    }

    #[test]
    fn count_tokens_path_is_query_evaluation() {
        let body = json!({"messages": [{"role": "user", "content": "hi"}], "max_tokens": 1024});
        assert_eq!(classify("/v1/messages/count_tokens", &body), RequestType::QueryEvaluation);
    }

    #[test]
    fn empty_body_is_quota() {
        assert_eq!(classify("/v1/messages", &json!({})), RequestType::Quota);
    }

    #[test]
    fn unrecognized_shape_is_other() {
        let body = json!({"model": "claude-3-7-sonnet"});
        assert_eq!(classify("/v1/messages", &body), RequestType::Other);
    }
}
