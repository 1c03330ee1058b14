mod support;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use askpipe_local::weather::OpenWeather;
use axum::extract::RawQuery;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use support::{
    app_with, body_text, chat_body, parse_sse, request, sse_stages, EnvGuard, ScriptedBackend,
    ENV_LOCK,
};

async fn openweather_fixture(hits: Arc<AtomicUsize>) -> SocketAddr {
    let app = Router::new().route(
        "/weather",
        get(move |RawQuery(_): RawQuery| {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (
                    StatusCode::OK,
                    r#"{"weather":[{"main":"Clear","description":"clear sky"}],
                        "main":{"temp":22.3,"feels_like":21.8,"humidity":45},
                        "wind":{"speed":3.0},
                        "sys":{"country":"US"},
                        "name":"Boston","id":4930956}"#
                        .to_string(),
                )
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Small model, time-sensitive question: pre-flight routes to extraction,
/// the weather provider answers once, and the second identical request is
/// served from the cache without touching the provider again.
#[tokio::test]
#[allow(clippy::await_holding_lock)]
async fn weather_question_fetches_once_then_caches() {
    let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let hits = Arc::new(AtomicUsize::new(0));
    let addr = openweather_fixture(hits.clone()).await;
    let _endpoint = EnvGuard::set(
        "ASKPIPE_OPENWEATHER_ENDPOINT",
        &format!("http://{addr}/weather"),
    );

    let backend = ScriptedBackend::new(&[
        "WEATHER: Boston",
        "It is a clear 22C in Boston right now. ",
        "WEATHER: Boston",
        "Boston is still clear at 22C. ",
    ]);
    let client = askpipe_local::default_client().unwrap();
    let weather = OpenWeather::new(client, "test-key");
    let (app, _cache) = app_with(backend.clone(), None, Some(weather));

    let resp = request(
        &app,
        "POST",
        "/chat/stream",
        None,
        Some(chat_body("llama3.2:1b", "What is the weather in Boston today?")),
    )
    .await;
    let frames = parse_sse(&body_text(resp).await);

    assert_eq!(
        sse_stages(&frames),
        ["initializing", "thinking", "searching", "reading_content", "generating"]
    );
    let searching = frames
        .iter()
        .find(|(_, data)| data["stage"] == "searching")
        .unwrap();
    assert_eq!(searching.1["message"], "Searching weather for: Boston");
    let reading = frames
        .iter()
        .find(|(_, data)| data["stage"] == "reading_content")
        .unwrap();
    assert_eq!(
        reading.1["message"],
        "Reading content from openweathermap.org"
    );

    let (event, done) = frames.last().unwrap();
    assert_eq!(event, "done");
    assert_eq!(done["search_performed"], true);
    assert_eq!(done["search_type"], "weather");
    assert_eq!(done["search_query"], "Boston");
    assert_eq!(done["source"], "https://openweathermap.org/city/4930956");
    let first_id = done["search_id"].as_u64().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let resp = request(
        &app,
        "POST",
        "/chat/stream",
        None,
        Some(chat_body("llama3.2:1b", "What is the weather in Boston today?")),
    )
    .await;
    let frames = parse_sse(&body_text(resp).await);
    let (event, done) = frames.last().unwrap();
    assert_eq!(event, "done");
    assert_eq!(done["search_id"].as_u64().unwrap(), first_id);
    assert_eq!(done["source"], "https://openweathermap.org/city/4930956");

    // The provider was consulted exactly once across both requests.
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(backend.call_count(), 4);
}
