// ABOUTME: End-to-end tests for the chat turn orchestrator
// ABOUTME: Uses a scripted provider to drive event ordering, billing, and fan-out
//
// SPDX-License-Identifier: MIT OR Apache-2.0

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use durachat::chat::{ChatOrchestrator, TurnRequest};
use durachat::config::{BillingConfig, StreamingConfig, SystemKeys};
use durachat::credits::CreditLedger;
use durachat::crypto::ApiKeyCipher;
use durachat::errors::{AppError, AppResult};
use durachat::providers::registry::ProviderFactory;
use durachat::providers::{
    ChatProvider, EventStream, KeyResolver, ModelInfo, ProviderInfo, ProviderRegistry,
    StreamEvent, StreamRequest, UsageInfo,
};
use durachat::session::{ConnectionMeta, SessionRegistry};
use durachat::store::{
    Attachment, BlobStore, ChatStore, Conversation, LedgerContext, LedgerEntryType, SqliteStore,
};

const PROVIDER: &str = "scripted";
const MODEL: &str = "test-model";

/// Adapter that replays a fixed event script and records the request
struct ScriptedProvider {
    events: Arc<Vec<StreamEvent>>,
    fail_at_end: bool,
    captured: Arc<Mutex<Option<StreamRequest>>>,
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn buffers_thinking(&self) -> bool {
        true
    }

    async fn stream_chat(&self, request: &StreamRequest) -> AppResult<EventStream> {
        *self.captured.lock().unwrap() = Some(request.clone());
        let mut items: Vec<Result<StreamEvent, AppError>> =
            self.events.iter().cloned().map(Ok).collect();
        if self.fail_at_end {
            items.push(Err(AppError::provider_stream(PROVIDER, "connection reset")));
        }
        Ok(Box::pin(futures_util::stream::iter(items)))
    }
}

struct Harness {
    orchestrator: Arc<ChatOrchestrator>,
    sessions: Arc<SessionRegistry>,
    store: Arc<SqliteStore>,
    captured: Arc<Mutex<Option<StreamRequest>>>,
}

async fn harness(events: Vec<StreamEvent>, fail_at_end: bool) -> Result<Harness> {
    let store = Arc::new(SqliteStore::in_memory().await?);
    let chat_store: Arc<dyn ChatStore> = Arc::clone(&store) as Arc<dyn ChatStore>;
    let blob_store: Arc<dyn BlobStore> = Arc::clone(&store) as Arc<dyn BlobStore>;

    let captured = Arc::new(Mutex::new(None));
    let events = Arc::new(events);
    let factory_captured = Arc::clone(&captured);
    let factory: ProviderFactory = Arc::new(move |_config| {
        Box::new(ScriptedProvider {
            events: Arc::clone(&events),
            fail_at_end,
            captured: Arc::clone(&factory_captured),
        })
    });

    let info = ProviderInfo {
        name: PROVIDER,
        display_name: "Scripted",
        default_model: MODEL,
        supported_attachment_types: &["image/png"],
        models: vec![ModelInfo {
            id: MODEL,
            display_name: "Test Model",
            context_window: None,
            prompt_cost_per_1k: Some(10.0),
            completion_cost_per_1k: Some(20.0),
            supports_thinking: true,
            supports_search: false,
            supports_reasoning_effort: false,
            reasoning_effort_levels: &[],
            default_reasoning_effort: None,
        }],
    };
    let mut registry = ProviderRegistry::new();
    registry.register(info, factory);
    let registry = Arc::new(registry);

    let mut system_keys = HashMap::new();
    system_keys.insert(PROVIDER.to_owned(), "system-key".to_owned());
    let resolver = Arc::new(KeyResolver::new(
        ApiKeyCipher::new([0u8; 32]),
        Arc::clone(&chat_store),
        SystemKeys::from_map(system_keys),
    ));
    let credits = Arc::new(CreditLedger::new(
        Arc::clone(&chat_store),
        Arc::clone(&registry),
        BillingConfig::default(),
    ));
    let sessions = Arc::new(SessionRegistry::new());

    let orchestrator = Arc::new(ChatOrchestrator::new(
        chat_store,
        blob_store,
        registry,
        resolver,
        credits,
        Arc::clone(&sessions),
        BillingConfig::default(),
        StreamingConfig::default(),
    ));

    Ok(Harness {
        orchestrator,
        sessions,
        store,
        captured,
    })
}

impl Harness {
    fn connect(&self, session_id: &str, user_id: Option<Uuid>) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = self.sessions.register(ConnectionMeta {
            session_id: session_id.to_owned(),
            user_id,
            conversation_id: None,
            sender: tx,
        });
        (connection_id, rx)
    }

    async fn fund(&self, user_id: Uuid, cents: i64) -> Result<()> {
        self.store.ensure_settings(user_id).await?;
        self.store
            .add_balance(
                user_id,
                cents,
                LedgerEntryType::Topup,
                "test topup",
                LedgerContext::default(),
            )
            .await?;
        Ok(())
    }
}

fn turn(connection_id: Uuid, user_id: Option<Uuid>, prompt: &str) -> TurnRequest {
    TurnRequest {
        connection_id,
        session_id: "sess-1".to_owned(),
        user_id,
        prompt: prompt.to_owned(),
        conversation_id: None,
        message_id: None,
        provider: Some(PROVIDER.to_owned()),
        model: Some(MODEL.to_owned()),
        reasoning_effort: None,
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<serde_json::Value> {
    let mut events = Vec::new();
    while let Ok(payload) = rx.try_recv() {
        events.push(serde_json::from_str(&payload).unwrap());
    }
    events
}

fn event_types(events: &[serde_json::Value]) -> Vec<String> {
    events
        .iter()
        .map(|e| e["type"].as_str().unwrap().to_owned())
        .collect()
}

fn happy_script() -> Vec<StreamEvent> {
    vec![
        StreamEvent::ThinkingStart,
        StreamEvent::ThinkingToken("a".into()),
        StreamEvent::ThinkingToken("b".into()),
        StreamEvent::ThinkingToken("c".into()),
        StreamEvent::ThinkingEnd,
        StreamEvent::ResponseStart,
        StreamEvent::TextDelta("The ".into()),
        StreamEvent::TextDelta("answer.".into()),
        StreamEvent::Complete {
            text: "The answer.".into(),
            usage: Some(UsageInfo {
                prompt_tokens: 100,
                completion_tokens: 50,
                total_tokens: 150,
                cost_cents: None,
                duration_ms: Some(900),
            }),
        },
    ]
}

#[tokio::test]
async fn full_turn_orders_events_and_settles_credits() -> Result<()> {
    let h = harness(happy_script(), false).await?;
    let user_id = Uuid::new_v4();
    h.fund(user_id, 1000).await?;
    let (connection_id, mut rx) = h.connect("sess-1", Some(user_id));

    h.orchestrator
        .start_chat(turn(connection_id, Some(user_id), "What is love?"))
        .await;

    let events = drain(&mut rx);
    assert_eq!(
        event_types(&events),
        vec![
            "conversation_created",
            "conversation_updated",
            "new_message",
            "new_message",
            "thinking_start",
            "thinking",
            "thinking_end",
            "response_start",
            "text",
            "text",
            "done",
        ]
    );

    // Title derived from the prompt, broadcast before any tokens
    assert_eq!(events[1]["conversation"]["title"], "What is love?");
    // Thinking tokens batched into one frame, answer tokens unbatched
    assert_eq!(events[5]["content"], "abc");
    assert_eq!(events[8]["content"], "The ");
    let done = events.last().unwrap();
    assert_eq!(done["usage"]["promptTokens"], 100);
    // Pricing: 100/1K * 10 + 50/1K * 20 = 2 cents
    assert_eq!(done["usage"]["costCents"], 2);

    // Ledger: 2 cents * 1.05 markup, ceiled to 3
    assert_eq!(h.store.current_balance(user_id).await?, 997);

    let conversation_id =
        Uuid::parse_str(events[0]["conversation"]["id"].as_str().unwrap()).unwrap();
    let messages = h.store.list_messages(conversation_id).await?;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "What is love?");
    assert_eq!(messages[1].content, "The answer.");
    assert_eq!(messages[1].thinking_content.as_deref(), Some("abc"));
    assert!(messages[1].stream_completed);

    let usage = h.store.usage_for_message(messages[1].id).await?.unwrap();
    assert_eq!(usage.cost_cents, 2);
    Ok(())
}

#[tokio::test]
async fn zero_balance_fails_before_streaming() -> Result<()> {
    let h = harness(happy_script(), false).await?;
    let user_id = Uuid::new_v4();
    h.store.ensure_settings(user_id).await?;
    let (connection_id, mut rx) = h.connect("sess-1", Some(user_id));

    h.orchestrator
        .start_chat(turn(connection_id, Some(user_id), "hello"))
        .await;

    let events = drain(&mut rx);
    let types = event_types(&events);
    assert!(types.contains(&"error".to_owned()));
    assert!(!types.contains(&"text".to_owned()));
    assert!(!types.contains(&"done".to_owned()));

    // The placeholder is left in the failed terminal state
    let conversation_id =
        Uuid::parse_str(events[0]["conversation"]["id"].as_str().unwrap()).unwrap();
    let messages = h.store.list_messages(conversation_id).await?;
    let assistant = messages.last().unwrap();
    assert!(!assistant.is_streaming);
    assert!(!assistant.stream_completed);
    assert_eq!(h.store.current_balance(user_id).await?, 0);
    Ok(())
}

#[tokio::test]
async fn anonymous_turns_are_never_billed() -> Result<()> {
    let h = harness(happy_script(), false).await?;
    let (connection_id, mut rx) = h.connect("sess-1", None);

    h.orchestrator
        .start_chat(turn(connection_id, None, "hello"))
        .await;

    let events = drain(&mut rx);
    assert!(event_types(&events).contains(&"done".to_owned()));
    Ok(())
}

#[tokio::test]
async fn second_tab_receives_broadcasts_without_duplicating_echo() -> Result<()> {
    let h = harness(happy_script(), false).await?;
    let user_id = Uuid::new_v4();
    h.fund(user_id, 1000).await?;

    // First turn creates the conversation
    let (tab_a, mut rx_a) = h.connect("sess-1", Some(user_id));
    h.orchestrator
        .start_chat(turn(tab_a, Some(user_id), "first"))
        .await;
    let events = drain(&mut rx_a);
    let conversation_id =
        Uuid::parse_str(events[0]["conversation"]["id"].as_str().unwrap()).unwrap();

    // Second tab attaches to the same conversation
    let (tab_b, mut rx_b) = h.connect("sess-2", Some(user_id));
    h.sessions.set_conversation(tab_b, Some(conversation_id));

    let mut second = turn(tab_a, Some(user_id), "second");
    second.conversation_id = Some(conversation_id);
    h.orchestrator.start_chat(second).await;

    let a_types = event_types(&drain(&mut rx_a));
    let b_types = event_types(&drain(&mut rx_b));

    // The sender sees each message exactly once (local echo, no broadcast copy)
    assert_eq!(a_types.iter().filter(|t| *t == "new_message").count(), 2);
    assert_eq!(b_types.iter().filter(|t| *t == "new_message").count(), 2);
    assert_eq!(a_types.iter().filter(|t| *t == "text").count(), 2);
    assert_eq!(b_types.iter().filter(|t| *t == "text").count(), 2);
    assert!(b_types.contains(&"done".to_owned()));
    Ok(())
}

#[tokio::test]
async fn bare_turn_continues_the_session_bound_conversation() -> Result<()> {
    let h = harness(happy_script(), false).await?;
    let user_id = Uuid::new_v4();
    h.fund(user_id, 1000).await?;
    let (connection_id, mut rx) = h.connect("sess-1", Some(user_id));

    h.orchestrator
        .start_chat(turn(connection_id, Some(user_id), "first"))
        .await;
    let events = drain(&mut rx);
    let conversation_id =
        Uuid::parse_str(events[0]["conversation"]["id"].as_str().unwrap()).unwrap();

    // A second turn naming no conversation continues the bound one
    h.orchestrator
        .start_chat(turn(connection_id, Some(user_id), "second"))
        .await;
    let types = event_types(&drain(&mut rx));
    assert!(!types.contains(&"conversation_created".to_owned()));
    assert!(types.contains(&"done".to_owned()));
    assert_eq!(h.store.list_conversations(user_id).await?.len(), 1);
    assert_eq!(h.store.list_messages(conversation_id).await?.len(), 4);

    // A fresh untagged tab of the session resolves the persisted binding
    let (late_tab, mut late_rx) = h.connect("sess-1", Some(user_id));
    h.orchestrator
        .start_chat(turn(late_tab, Some(user_id), "third"))
        .await;
    let types = event_types(&drain(&mut late_rx));
    assert!(!types.contains(&"conversation_created".to_owned()));
    assert_eq!(h.store.list_conversations(user_id).await?.len(), 1);
    assert_eq!(h.store.list_messages(conversation_id).await?.len(), 6);
    Ok(())
}

#[tokio::test]
async fn untagged_tab_of_same_session_receives_live_events() -> Result<()> {
    let h = harness(happy_script(), false).await?;
    let user_id = Uuid::new_v4();
    h.fund(user_id, 1000).await?;

    // Two tabs of one session, neither viewing a conversation yet
    let (tab_a, mut rx_a) = h.connect("sess-1", Some(user_id));
    let (tab_b, mut rx_b) = h.connect("sess-1", Some(user_id));

    h.orchestrator
        .start_chat(turn(tab_a, Some(user_id), "hello"))
        .await;

    let a_types = event_types(&drain(&mut rx_a));
    let b_types = event_types(&drain(&mut rx_b));
    assert!(a_types.contains(&"done".to_owned()));

    // The turn bound the session, pulling the untagged tab into the fan-out
    assert_eq!(
        h.sessions.conversation_of(tab_b),
        h.sessions.conversation_of(tab_a)
    );
    assert_eq!(b_types.iter().filter(|t| *t == "new_message").count(), 2);
    assert!(b_types.contains(&"text".to_owned()));
    assert!(b_types.contains(&"done".to_owned()));
    // Creation is acknowledged to the initiating tab only
    assert!(!b_types.contains(&"conversation_created".to_owned()));
    Ok(())
}

#[tokio::test]
async fn oversized_attachment_is_skipped_and_text_file_excerpted() -> Result<()> {
    let h = harness(happy_script(), false).await?;
    let user_id = Uuid::new_v4();
    h.fund(user_id, 1000).await?;
    let (connection_id, mut rx) = h.connect("sess-1", Some(user_id));

    let conversation = Conversation::new(user_id, PROVIDER, MODEL);
    h.store.create_conversation(&conversation).await?;
    let message_id = Uuid::new_v4();

    let attach = |file_name: &str, mime: &str, size: i64, blob_key: &str| Attachment {
        id: Uuid::new_v4(),
        conversation_id: conversation.id,
        message_id: Some(message_id),
        file_name: file_name.to_owned(),
        mime_type: mime.to_owned(),
        size_bytes: size,
        blob_key: blob_key.to_owned(),
        created_at: chrono::Utc::now(),
    };

    // Oversized image: no blob needed, it is skipped on size alone
    h.store
        .create_attachment(&attach("huge.png", "image/png", 15 * 1024 * 1024, "huge"))
        .await?;
    h.store.put("notes", b"meeting notes here", "text/plain").await?;
    h.store
        .create_attachment(&attach("notes.txt", "text/plain", 18, "notes"))
        .await?;
    h.store.put("photo", b"png-bytes", "image/png").await?;
    h.store
        .create_attachment(&attach("photo.png", "image/png", 9, "photo"))
        .await?;

    let mut request = turn(connection_id, Some(user_id), "see attachments");
    request.conversation_id = Some(conversation.id);
    request.message_id = Some(message_id);
    h.orchestrator.start_chat(request).await;

    let types = event_types(&drain(&mut rx));
    assert!(types.contains(&"done".to_owned()));

    let captured = h.captured.lock().unwrap().clone().unwrap();
    let user_message = captured.messages.last().unwrap();
    // One text part (prompt + excerpt) plus the small inlined image
    assert_eq!(user_message.content.len(), 2);
    let text = user_message.text();
    assert!(text.contains("see attachments"));
    assert!(text.contains("[File: notes.txt]"));
    assert!(text.contains("meeting notes here"));
    assert!(!text.contains("huge.png"));
    Ok(())
}

#[tokio::test]
async fn midstream_failure_keeps_partial_content() -> Result<()> {
    let script = vec![
        StreamEvent::ResponseStart,
        StreamEvent::TextDelta("Hello ".into()),
        StreamEvent::TextDelta("wor".into()),
    ];
    let h = harness(script, true).await?;
    let user_id = Uuid::new_v4();
    h.fund(user_id, 1000).await?;
    let (connection_id, mut rx) = h.connect("sess-1", Some(user_id));

    h.orchestrator
        .start_chat(turn(connection_id, Some(user_id), "hello"))
        .await;

    let events = drain(&mut rx);
    let types = event_types(&events);
    assert_eq!(types.iter().filter(|t| *t == "text").count(), 2);
    assert!(types.contains(&"error".to_owned()));
    assert!(!types.contains(&"done".to_owned()));

    let conversation_id =
        Uuid::parse_str(events[0]["conversation"]["id"].as_str().unwrap()).unwrap();
    let messages = h.store.list_messages(conversation_id).await?;
    let assistant = messages.last().unwrap();
    assert_eq!(assistant.content, "Hello wor");
    assert!(!assistant.stream_completed);
    // No settlement for a failed turn
    assert_eq!(h.store.current_balance(user_id).await?, 1000);
    Ok(())
}

#[tokio::test]
async fn switch_conversation_replays_state_and_persists_binding() -> Result<()> {
    let h = harness(happy_script(), false).await?;
    let user_id = Uuid::new_v4();
    h.fund(user_id, 1000).await?;
    let (connection_id, mut rx) = h.connect("sess-1", Some(user_id));

    h.orchestrator
        .start_chat(turn(connection_id, Some(user_id), "hello"))
        .await;
    let events = drain(&mut rx);
    let conversation_id =
        Uuid::parse_str(events[0]["conversation"]["id"].as_str().unwrap()).unwrap();

    h.orchestrator
        .switch_conversation(connection_id, "sess-1", Some(conversation_id))
        .await?;
    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "conversation_switched");
    assert_eq!(events[0]["hasActiveStream"], false);
    assert_eq!(events[0]["messages"].as_array().unwrap().len(), 2);
    assert_eq!(
        h.store.session_conversation("sess-1").await?,
        Some(conversation_id)
    );

    h.orchestrator
        .switch_conversation(connection_id, "sess-1", None)
        .await?;
    let events = drain(&mut rx);
    assert!(events[0]["conversation"].is_null());
    assert_eq!(h.store.session_conversation("sess-1").await?, None);
    Ok(())
}

#[tokio::test]
async fn rejects_unknown_model_before_any_side_effect() -> Result<()> {
    let h = harness(happy_script(), false).await?;
    let user_id = Uuid::new_v4();
    h.fund(user_id, 1000).await?;
    let (connection_id, mut rx) = h.connect("sess-1", Some(user_id));

    let mut request = turn(connection_id, Some(user_id), "hello");
    request.model = Some("made-up-model".to_owned());
    h.orchestrator.start_chat(request).await;

    let events = drain(&mut rx);
    assert_eq!(event_types(&events), vec!["error"]);
    assert!(h.store.sync_since(user_id, None).await?.conversations.is_empty());
    Ok(())
}
