use super::*;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn embedder_for(server: &MockServer, batch_size: u32) -> OllamaEmbedder {
    let base_url = Url::parse(&server.uri()).expect("mock server uri should parse");
    OllamaEmbedder::with_base_url(base_url, "nomic-embed-text:latest", batch_size)
        .with_retry_delay(Duration::from_millis(10))
}

/// Answers every embed request with one `[index, input length]` vector per input
fn echo_embeddings(request: &Request) -> ResponseTemplate {
    let body: serde_json::Value =
        serde_json::from_slice(&request.body).expect("request body should be json");
    let inputs = body["input"].as_array().cloned().unwrap_or_default();
    let embeddings: Vec<Vec<f32>> = inputs
        .iter()
        .enumerate()
        .map(|(i, input)| vec![i as f32, input.as_str().map_or(0, str::len) as f32])
        .collect();
    ResponseTemplate::new(200).set_body_json(serde_json::json!({ "embeddings": embeddings }))
}

#[test]
fn client_configuration() {
    let mut config = Config::default();
    config.ollama.host = "test-host".to_string();
    config.ollama.port = 1234;
    config.embedding.model = "test-model".to_string();
    config.embedding.batch_size = 128;

    let client = OllamaEmbedder::new(&config).expect("Failed to create client");

    assert_eq!(client.model, "test-model");
    assert_eq!(client.batch_size, 128);
    assert_eq!(client.base_url.host_str(), Some("test-host"));
    assert_eq!(client.base_url.port(), Some(1234));
    assert_eq!(client.retry_attempts, DEFAULT_RETRY_ATTEMPTS);
    assert_eq!(client.model_id(), "ollama:test-model");
}

#[test]
fn client_builder_methods() {
    let client = OllamaEmbedder::new(&Config::default())
        .expect("Failed to create client")
        .with_timeout(Duration::from_secs(60))
        .with_retry_attempts(5);
    assert_eq!(client.retry_attempts, 5);

    let client = client.with_retry_attempts(0);
    assert_eq!(client.retry_attempts, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn embed_batch_splits_requests() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(echo_embeddings)
        .expect(2)
        .mount(&server)
        .await;

    let embedder = embedder_for(&server, 2);
    let texts = vec!["a".to_string(), "bb".to_string(), "ccc".to_string()];
    let vectors = tokio::task::spawn_blocking(move || embedder.embed_batch(&texts))
        .await
        .expect("blocking task should join")
        .expect("embedding should succeed");

    assert_eq!(
        vectors,
        vec![vec![0.0, 1.0], vec![1.0, 2.0], vec![0.0, 3.0]]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn embed_query_returns_single_vector() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(echo_embeddings)
        .mount(&server)
        .await;

    let embedder = embedder_for(&server, 8);
    let vector = tokio::task::spawn_blocking(move || embedder.embed_query("orders"))
        .await
        .expect("blocking task should join")
        .expect("query embedding should succeed");
    assert_eq!(vector, vec![0.0, 6.0]);
}

#[tokio::test(flavor = "multi_thread")]
async fn server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(echo_embeddings)
        .mount(&server)
        .await;

    let embedder = embedder_for(&server, 8);
    let result = tokio::task::spawn_blocking(move || embedder.embed_query("orders"))
        .await
        .expect("blocking task should join");
    assert!(result.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let embedder = embedder_for(&server, 8);
    let result = tokio::task::spawn_blocking(move || embedder.embed_query("orders"))
        .await
        .expect("blocking task should join");
    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn count_mismatch_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "embeddings": [[1.0, 2.0]] })),
        )
        .mount(&server)
        .await;

    let embedder = embedder_for(&server, 8);
    let texts = vec!["a".to_string(), "b".to_string()];
    let result = tokio::task::spawn_blocking(move || embedder.embed_batch(&texts))
        .await
        .expect("blocking task should join");
    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn health_check_finds_model() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "models": [{ "name": "nomic-embed-text:latest", "size": 274302450 }]
        })))
        .mount(&server)
        .await;

    let embedder = embedder_for(&server, 8);
    let missing = OllamaEmbedder::with_base_url(
        Url::parse(&server.uri()).expect("mock server uri should parse"),
        "mxbai-embed-large",
        8,
    );

    let (found, absent) =
        tokio::task::spawn_blocking(move || (embedder.health_check(), missing.health_check()))
            .await
            .expect("blocking task should join");
    assert!(found.is_ok());
    assert!(absent.is_err());
}
