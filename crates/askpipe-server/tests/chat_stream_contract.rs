mod support;

use askpipe_core::SearchKind;
use askpipe_local::cache::{ContentBlock, Namespace};
use axum::http::StatusCode;
use support::{
    app, body_text, chat_body, parse_sse, request, sse_stages, sse_text, ScriptedBackend,
};

#[tokio::test]
async fn direct_answer_stream_honors_the_wire_contract() {
    let backend = ScriptedBackend::new(&["Paris has been the capital of France since 987. "]);
    let (app, _cache) = app(backend.clone(), None);

    let resp = request(
        &app,
        "POST",
        "/chat/stream",
        None,
        Some(chat_body("llama3.1:70b", "What is the capital of France?")),
    )
    .await;

    assert_eq!(resp.status(), StatusCode::OK);
    let headers = resp.headers().clone();
    assert_eq!(headers.get("content-type").unwrap(), "text/event-stream");
    assert_eq!(headers.get("cache-control").unwrap(), "no-cache");
    assert_eq!(headers.get("connection").unwrap(), "keep-alive");
    assert_eq!(headers.get("x-accel-buffering").unwrap(), "no");

    let raw = body_text(resp).await;
    let frames = parse_sse(&raw);

    assert_eq!(sse_stages(&frames), ["initializing", "thinking"]);
    assert_eq!(
        sse_text(&frames),
        "Paris has been the capital of France since 987. "
    );

    // Sequence numbers rise strictly and exactly one terminal frame closes.
    let seqs: Vec<u64> = frames
        .iter()
        .map(|(_, data)| data["seq"].as_u64().unwrap())
        .collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    let terminals = frames
        .iter()
        .filter(|(event, _)| event == "done" || event == "error")
        .count();
    assert_eq!(terminals, 1);

    let (event, done) = frames.last().unwrap();
    assert_eq!(event, "done");
    assert_eq!(
        done["response"],
        "Paris has been the capital of France since 987."
    );
    assert_eq!(done["search_performed"], false);
    assert_eq!(done["cutoff_retries"], 0);
}

#[tokio::test]
async fn cutoff_admission_is_withheld_and_rerouted() {
    let backend = ScriptedBackend::new(&[
        "My knowledge cutoff prevents an answer here.",
        "GOOGLE: rust release news",
        "Rust 1.80 shipped with stabilized lazy statics. ",
    ]);
    let (app, cache) = app(backend.clone(), None);
    cache
        .admit(
            Namespace::Query,
            SearchKind::Web,
            "rust release news",
            vec![ContentBlock::new(
                "https://blog.rust-lang.org/2025/01/rust-1-80.html",
                "Rust 1.80 stabilized LazyLock and LazyCell.",
            )],
            None,
            None,
        )
        .await;

    let resp = request(
        &app,
        "POST",
        "/chat/stream",
        None,
        Some(chat_body("llama3.1:70b", "Tell me about the rust release")),
    )
    .await;
    let frames = parse_sse(&body_text(resp).await);

    assert_eq!(
        sse_stages(&frames),
        ["initializing", "thinking", "rerouting", "searching", "reading_content", "generating"]
    );
    assert!(!sse_text(&frames).contains("knowledge cutoff"));

    let rerouting = frames
        .iter()
        .find(|(_, data)| data["stage"] == "rerouting")
        .unwrap();
    assert_eq!(
        rerouting.1["message"],
        "Detecting knowledge limitation, searching for current information..."
    );

    let (event, done) = frames.last().unwrap();
    assert_eq!(event, "done");
    assert_eq!(done["cutoff_retries"], 1);
    assert_eq!(done["search_type"], "web");
    assert_eq!(done["search_query"], "rust release news");
    assert_eq!(backend.call_count(), 3);
}

#[tokio::test]
async fn recall_id_replays_the_cached_search() {
    let backend = ScriptedBackend::new(&["They flew 140 missions that year. "]);
    let (app, cache) = app(backend.clone(), None);
    let id = cache
        .admit(
            Namespace::Query,
            SearchKind::Web,
            "spacex launch record",
            vec![ContentBlock::new(
                "https://www.space.com/spacex-falcon-9-launch-record-2025",
                "SpaceX set a new annual launch record.",
            )],
            None,
            None,
        )
        .await;

    let prompt = format!("[search_id: {id}] what was the record?");
    let resp = request(
        &app,
        "POST",
        "/chat/stream",
        None,
        Some(chat_body("llama3.1:70b", &prompt)),
    )
    .await;
    let frames = parse_sse(&body_text(resp).await);

    assert_eq!(
        sse_stages(&frames),
        ["initializing", "thinking", "recalling", "reading_content", "generating"]
    );
    let recalling = frames
        .iter()
        .find(|(_, data)| data["stage"] == "recalling")
        .unwrap();
    assert_eq!(recalling.1["message"], "Let me look at it...");
    let reading = frames
        .iter()
        .find(|(_, data)| data["stage"] == "reading_content")
        .unwrap();
    assert_eq!(reading.1["message"], "Reading content from www.space.com");

    let (event, done) = frames.last().unwrap();
    assert_eq!(event, "done");
    assert_eq!(done["search_id"], id);
    assert_eq!(done["search_query"], "spacex launch record");
    assert_eq!(
        done["source"],
        "https://www.space.com/spacex-falcon-9-launch-record-2025"
    );
    assert_eq!(backend.call_count(), 1);
}

#[tokio::test]
async fn identical_searches_share_one_cache_entry() {
    let backend = ScriptedBackend::new(&[
        "WEATHER: Boston",
        "Sunny and 22C right now. ",
        "WEATHER: Boston",
        "Still sunny, still 22C. ",
    ]);
    let (app, cache) = app(backend.clone(), None);
    cache
        .admit(
            Namespace::Query,
            SearchKind::Weather,
            "Boston",
            vec![ContentBlock::new(
                "https://openweathermap.org/city/4930956",
                "Boston: 22C, clear sky",
            )],
            None,
            None,
        )
        .await;

    let mut ids = Vec::new();
    for _ in 0..2 {
        let resp = request(
            &app,
            "POST",
            "/chat/stream",
            None,
            Some(chat_body("llama3.1:70b", "How is Boston looking?")),
        )
        .await;
        let frames = parse_sse(&body_text(resp).await);
        let (event, done) = frames.last().unwrap();
        assert_eq!(event, "done");
        assert_eq!(done["search_type"], "weather");
        ids.push(done["search_id"].as_u64().unwrap());
    }

    assert_eq!(ids[0], ids[1]);
    // Two calls per request: the marker turn and the synthesis turn. A
    // cache miss would have added nothing either, but the shared id above
    // proves both requests read the same stored entry.
    assert_eq!(backend.call_count(), 4);
}

#[tokio::test]
async fn generation_failure_ends_with_an_error_event() {
    let (app, _cache) = app(ScriptedBackend::new(&[]), None);

    let resp = request(
        &app,
        "POST",
        "/chat/stream",
        None,
        Some(chat_body("llama3.1:70b", "anything at all")),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let frames = parse_sse(&body_text(resp).await);

    assert_eq!(sse_stages(&frames), ["initializing", "thinking"]);
    let (event, data) = frames.last().unwrap();
    assert_eq!(event, "error");
    assert_eq!(data["error"], "generation");
    assert!(data["message"].as_str().unwrap().contains("script exhausted"));
    let terminals = frames
        .iter()
        .filter(|(event, _)| event == "done" || event == "error")
        .count();
    assert_eq!(terminals, 1);
}
