use super::*;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn orders_table() -> Table {
    Table::new(Some("public"), "orders").with_column("id", "INTEGER", false)
}

fn summarizer_for(server: &MockServer, timeout: Duration) -> OllamaSummarizer {
    let base_url = Url::parse(&server.uri()).expect("mock server uri should parse");
    OllamaSummarizer::with_base_url(base_url, "llama3.2:latest", timeout)
}

#[tokio::test(flavor = "multi_thread")]
async fn summarize_returns_model_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "model": "llama3.2:latest",
            "response": "Stores customer purchases.",
            "done": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let summarizer = summarizer_for(&server, Duration::from_secs(5));
    let summary = tokio::task::spawn_blocking(move || {
        summarizer.summarize(&orders_table(), "# Table: public.orders")
    })
    .await
    .expect("blocking task should join")
    .expect("summary should succeed");

    assert_eq!(summary, "Stores customer purchases.");
}

#[tokio::test(flavor = "multi_thread")]
async fn summarize_fails_on_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "response": "late" }))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let summarizer = summarizer_for(&server, Duration::from_millis(200));
    let result = tokio::task::spawn_blocking(move || {
        summarizer.summarize(&orders_table(), "# Table: public.orders")
    })
    .await
    .expect("blocking task should join");

    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn summarize_fails_on_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let summarizer = summarizer_for(&server, Duration::from_secs(5));
    let result = tokio::task::spawn_blocking(move || {
        summarizer.summarize(&orders_table(), "# Table: public.orders")
    })
    .await
    .expect("blocking task should join");

    assert!(result.is_err());
}

#[test]
fn id_is_model_name() {
    let base_url = Url::parse("http://localhost:11434").expect("url should parse");
    let summarizer =
        OllamaSummarizer::with_base_url(base_url, "llama3.2:latest", Duration::from_secs(1));
    assert_eq!(summarizer.id(), "llama3.2:latest");
}
