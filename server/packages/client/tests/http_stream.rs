use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use agent_relay_chat_schema::{encode_line, AgentRequest, ConversationTurn, UiMessage};
use agent_relay_client::{
    group_messages, Conversation, ConversationUpdate, RelayClient, RenderGroup, RunOutcome,
};
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde_json::json;

fn scripted_run() -> Vec<UiMessage> {
    vec![
        UiMessage::text("Sure"),
        UiMessage::text(" thing, héllo 🦀"),
        UiMessage::tool_call("Read", "toolu_1", ""),
        UiMessage::tool_call("", "toolu_1", "{\"file\":\"a\"}"),
        UiMessage::tool_result("toolu_1", "ok"),
        UiMessage::RunResult {
            subtype: "success".to_string(),
            cost_usd: 0.02,
            duration_ms: 1500,
        },
    ]
}

fn ndjson(messages: &[UiMessage]) -> Vec<u8> {
    messages
        .iter()
        .flat_map(|message| encode_line(message).expect("encode"))
        .collect()
}

async fn post_agent(Json(request): Json<AgentRequest>) -> Response {
    match request.prompt.as_str() {
        "reject" => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "type": "urn:agent-relay:error:invalid_request",
                "title": "Invalid Request",
                "status": 400,
                "detail": "invalid request: prompt must be a non-empty string"
            })),
        )
            .into_response(),
        "hang" => {
            let first = ndjson(&[UiMessage::text("partial")]);
            let body = stream::iter(vec![Ok::<_, Infallible>(Bytes::from(first))])
                .chain(stream::pending());
            ndjson_response(Body::from_stream(body))
        }
        "break" => {
            let first = ndjson(&[UiMessage::text("partial")]);
            let body = stream::iter(vec![Ok(Bytes::from(first))]).chain(stream::once(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Err::<Bytes, _>(io::Error::new(io::ErrorKind::ConnectionReset, "agent went away"))
            }));
            ndjson_response(Body::from_stream(body))
        }
        _ => {
            // Seven-byte chunks split lines and multi-byte characters alike.
            let chunks: Vec<Result<Bytes, Infallible>> = ndjson(&scripted_run())
                .chunks(7)
                .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
                .collect();
            ndjson_response(Body::from_stream(stream::iter(chunks)))
        }
    }
}

fn ndjson_response(body: Body) -> Response {
    (
        [
            (header::CONTENT_TYPE, "application/x-ndjson"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

async fn get_messages() -> Json<Vec<ConversationTurn>> {
    Json(vec![
        ConversationTurn::user("add a test"),
        ConversationTurn::assistant(vec![UiMessage::text("Sure")]),
    ])
}

async fn spawn_server() -> SocketAddr {
    let app = Router::new()
        .route("/api/agent", post(post_agent))
        .route("/api/messages", get(get_messages));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

#[tokio::test]
async fn streamed_run_lands_in_conversation() {
    let addr = spawn_server().await;
    let client = RelayClient::new(format!("http://{addr}")).expect("client");
    let mut conversation = Conversation::new();
    let mut updates = conversation.subscribe();

    let outcome = client
        .send_prompt(
            &AgentRequest::new("add a test"),
            &mut conversation,
            futures::future::pending::<()>(),
        )
        .await;

    assert_eq!(outcome, RunOutcome::Finished);
    assert_eq!(conversation.turns().len(), 2);
    assert_eq!(conversation.turns()[0], ConversationTurn::user("add a test"));
    assert_eq!(conversation.last_assistant_messages(), scripted_run().as_slice());

    let mut appended = 0;
    let mut finished = 0;
    while let Ok(update) = updates.try_recv() {
        match update {
            ConversationUpdate::MessageAppended { .. } => appended += 1,
            ConversationUpdate::RunFinished { .. } => finished += 1,
            ConversationUpdate::TurnAdded { .. } => {}
        }
    }
    assert_eq!(appended, scripted_run().len());
    assert_eq!(finished, 1);

    let groups = group_messages(conversation.last_assistant_messages());
    assert_eq!(
        groups[0],
        RenderGroup::Paragraph {
            text: "Sure thing, héllo 🦀".to_string()
        }
    );
    assert!(matches!(groups.last(), Some(RenderGroup::Completed { .. })));
}

#[tokio::test]
async fn rejected_request_becomes_error_record() {
    let addr = spawn_server().await;
    let client = RelayClient::new(format!("http://{addr}")).expect("client");
    let mut conversation = Conversation::new();

    let outcome = client
        .send_prompt(
            &AgentRequest::new("reject"),
            &mut conversation,
            futures::future::pending::<()>(),
        )
        .await;

    assert_eq!(outcome, RunOutcome::TransportFailed);
    match conversation.last_assistant_messages() {
        [UiMessage::Error { error }] => {
            assert!(error.contains("prompt must be a non-empty string"), "{error}");
        }
        other => panic!("unexpected messages: {other:?}"),
    }
}

#[tokio::test]
async fn abort_keeps_partial_turn_without_error() {
    let addr = spawn_server().await;
    let client = RelayClient::new(format!("http://{addr}")).expect("client");
    let mut conversation = Conversation::new();

    let outcome = client
        .send_prompt(
            &AgentRequest::new("hang"),
            &mut conversation,
            tokio::time::sleep(Duration::from_millis(300)),
        )
        .await;

    assert_eq!(outcome, RunOutcome::Aborted);
    assert_eq!(
        conversation.last_assistant_messages(),
        &[UiMessage::text("partial")]
    );
    assert_eq!(conversation.active_turn(), None);
}

#[tokio::test]
async fn body_failure_keeps_partial_records_and_appends_one_error() {
    let addr = spawn_server().await;
    let client = RelayClient::new(format!("http://{addr}")).expect("client");
    let mut conversation = Conversation::new();

    let outcome = client
        .send_prompt(
            &AgentRequest::new("break"),
            &mut conversation,
            futures::future::pending::<()>(),
        )
        .await;

    assert_eq!(outcome, RunOutcome::TransportFailed);
    match conversation.last_assistant_messages() {
        [first, UiMessage::Error { .. }] => assert_eq!(first, &UiMessage::text("partial")),
        other => panic!("unexpected messages: {other:?}"),
    }
    assert_eq!(conversation.active_turn(), None);
}

#[tokio::test]
async fn unreachable_server_appends_one_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let client = RelayClient::new(format!("http://{addr}")).expect("client");
    let mut conversation = Conversation::new();
    let outcome = client
        .send_prompt(
            &AgentRequest::new("hello"),
            &mut conversation,
            futures::future::pending::<()>(),
        )
        .await;

    assert_eq!(outcome, RunOutcome::TransportFailed);
    assert!(matches!(
        conversation.last_assistant_messages(),
        [UiMessage::Error { .. }]
    ));
}

#[tokio::test]
async fn history_loads_persisted_turns() {
    let addr = spawn_server().await;
    let client = RelayClient::new(format!("http://{addr}")).expect("client");
    let turns = client.history().await.expect("history");
    assert_eq!(turns.len(), 2);
    let conversation = Conversation::from_turns(turns);
    assert_eq!(
        conversation.last_assistant_messages(),
        &[UiMessage::text("Sure")]
    );
}
