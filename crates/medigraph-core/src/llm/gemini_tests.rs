use super::*;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MODEL: &str = "gemini-1.5-flash";

fn client_for(server: &MockServer, model: &str) -> GeminiClient {
    GeminiClient::new("g-test-key-1234", model).with_base_url(&server.uri())
}

#[tokio::test]
async fn test_chat_joins_parts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/v1beta/models/{}:generateContent", MODEL)))
        .and(header("x-goog-api-key", "g-test-key-1234"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": "MATCH (c:Condition) " }, { "text": "RETURN c.name\n" }] }
            }],
            "usageMetadata": { "promptTokenCount": 400, "candidatesTokenCount": 8, "totalTokenCount": 408 }
        })))
        .mount(&server)
        .await;

    let reply = client_for(&server, MODEL).chat("system", "List conditions").await.unwrap();
    assert_eq!(reply.data, "MATCH (c:Condition) RETURN c.name");
    assert_eq!(reply.usage.completion_tokens, 8);
    assert_eq!(reply.usage.total_tokens, 408);
}

#[tokio::test]
async fn test_system_instruction_and_model_prefix() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/v1beta/models/{}:generateContent", MODEL)))
        .and(body_partial_json(json!({
            "systemInstruction": { "parts": [{ "text": "Cypher only." }] },
            "contents": [{ "role": "user", "parts": [{ "text": "count patients" }] }],
            "generationConfig": { "candidateCount": 1 }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{ "content": { "parts": [{ "text": "RETURN 1" }] } }]
        })))
        .mount(&server)
        .await;

    let client = client_for(&server, &format!("models/{}", MODEL));
    assert_eq!(client.chat("Cypher only.", "count patients").await.unwrap().data, "RETURN 1");
}

#[tokio::test]
async fn test_permission_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": { "code": 403, "message": "API key not valid", "status": "PERMISSION_DENIED" }
        })))
        .mount(&server)
        .await;

    let err = client_for(&server, MODEL).chat("s", "u").await.unwrap_err().to_string();
    assert_eq!(err, "Gemini API error (403 Forbidden): PERMISSION_DENIED API key not valid");
}

#[tokio::test]
async fn test_blocked_prompt_has_no_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{ "finishReason": "SAFETY" }],
            "promptFeedback": { "blockReason": "SAFETY" }
        })))
        .mount(&server)
        .await;

    let err = client_for(&server, MODEL).chat("s", "u").await.unwrap_err().to_string();
    assert!(err.contains("No content"));
}
