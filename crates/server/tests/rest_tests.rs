//! REST surface tests against a local mock provider.

use axum::{Json, Router, routing::post};
use executor::{PathwayExecutor, Runtime};
use indexmap::IndexMap;
use serde_json::{Value, json};
use tokio::net::TcpListener;

async fn spawn_provider() -> String {
    async fn chat_completions(Json(body): Json<Value>) -> Json<Value> {
        let stream = body["stream"].as_bool().unwrap_or(false);
        assert!(!stream, "mock provider only serves non-streaming; streaming tests use their own mock");

        Json(json!({
            "id": "chatcmpl-mock",
            "object": "chat.completion",
            "created": 1,
            "model": "local-test",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hi from the mock"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
        }))
    }

    let app = Router::new().route("/chat/completions", post(chat_completions));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{address}")
}

async fn spawn_streaming_provider() -> String {
    async fn chat_completions() -> impl axum::response::IntoResponse {
        let body = concat!(
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"local-test\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hi\"},\"finish_reason\":null}]}\n\n",
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"local-test\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );

        (
            [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
            body,
        )
    }

    let app = Router::new().route("/chat/completions", post(chat_completions));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{address}")
}

async fn spawn_rest(provider_url: String) -> String {
    let endpoint: config::EndpointConfig = serde_json::from_value(json!({
        "url": provider_url,
        "requests_per_second": 100
    }))
    .unwrap();

    let mut models = IndexMap::new();
    models.insert(
        "local-test".to_string(),
        config::ModelConfig {
            provider: config::ProviderFamily::Local,
            endpoints: vec![endpoint],
            max_token_length: 8192,
            max_return_tokens: 256,
            supports_streaming: true,
        },
    );

    let mut pathways = IndexMap::new();
    pathways.insert(
        "chat".to_string(),
        config::PathwayConfig {
            prompts: vec!["{{messages}}".to_string()],
            model: "local-test".to_string(),
            emulate_openai_chat_model: Some("cortex-chat".to_string()),
            ..config::PathwayConfig::default()
        },
    );

    let config = config::Config {
        server: config::ServerConfig::default(),
        files: config::FilesConfig::default(),
        models,
        pathways,
    };

    let executor = PathwayExecutor::new(Runtime::new(config).unwrap());
    let app = server::router(executor);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{address}")
}

#[tokio::test(flavor = "multi_thread")]
async fn models_lists_configured_models_and_emulated_aliases() {
    let provider = spawn_provider().await;
    let base = spawn_rest(provider).await;

    let response: Value = reqwest::get(format!("{base}/v1/models"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(response["object"], "list");

    let ids: Vec<&str> = response["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|model| model["id"].as_str())
        .collect();

    assert!(ids.contains(&"local-test"));
    assert!(ids.contains(&"cortex-chat"));
}

#[tokio::test(flavor = "multi_thread")]
async fn chat_completions_answers_for_an_emulated_alias() {
    let provider = spawn_provider().await;
    let base = spawn_rest(provider).await;

    let response: Value = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "model": "cortex-chat",
            "messages": [{"role": "user", "content": "Hello!"}]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(response["object"], "chat.completion");
    assert_eq!(response["model"], "cortex-chat");
    assert_eq!(response["choices"][0]["message"]["content"], "Hi from the mock");
    assert_eq!(response["choices"][0]["finish_reason"], "stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn chat_completions_accepts_raw_model_names() {
    let provider = spawn_provider().await;
    let base = spawn_rest(provider).await;

    let response: Value = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "model": "local-test",
            "messages": [{"role": "user", "content": "Hello!"}]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(response["choices"][0]["message"]["content"], "Hi from the mock");
}

#[tokio::test(flavor = "multi_thread")]
async fn streaming_chat_completions_end_with_done() {
    let provider = spawn_streaming_provider().await;
    let base = spawn_rest(provider).await;

    let body = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "model": "cortex-chat",
            "messages": [{"role": "user", "content": "Hello!"}],
            "stream": true
        }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(body.contains("chat.completion.chunk"));
    assert!(body.contains("\"content\":\"Hi\""));

    let done_position = body.rfind("data: [DONE]").expect("stream must end with [DONE]");
    assert!(done_position > body.rfind("chat.completion.chunk").unwrap_or(0));

    // Chunks carry the emulated model name, not the upstream one.
    assert!(body.contains("cortex-chat"));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_models_return_an_openai_error_envelope() {
    let provider = spawn_provider().await;
    let base = spawn_rest(provider).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "model": "missing-model",
            "messages": [{"role": "user", "content": "Hello!"}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);

    let body: Value = response.json().await.unwrap();
    assert!(body["error"]["message"].as_str().unwrap().contains("missing-model"));
    assert_eq!(body["error"]["type"], "not_found_error");
}

#[tokio::test(flavor = "multi_thread")]
async fn legacy_completions_return_the_text_shape() {
    let provider = spawn_provider().await;
    let base = spawn_rest(provider).await;

    let response: Value = reqwest::Client::new()
        .post(format!("{base}/v1/completions"))
        .json(&json!({
            "model": "local-test",
            "prompt": "Say hi"
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(response["object"], "text_completion");
    assert_eq!(response["choices"][0]["text"], "Hi from the mock");
}
