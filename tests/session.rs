mod common;

use std::{sync::atomic::Ordering, time::Duration};

use serde_json::json;

use stream_chat_service::{
    ChatMode, ConversationStore,
    model::Role,
    session::{OutboundEvent, VISION_CHAT_TITLE},
};

use common::{TestSource, connect, error_text, finish_reason, harness, harness_with};

fn generate(message: &str, max_length: usize) -> String {
    json!({
        "command": "generate",
        "message": message,
        "max_length": max_length,
        "temperature": 0.0,
    })
    .to_string()
}

const STOP: &str = r#"{"command":"stop"}"#;

#[tokio::test]
async fn completed_generation_persists_both_turns() {
    let h = harness(TestSource::new());
    let mut client = connect(&h.state, "tiny-gpt", ChatMode::Text, &[&generate("Hello", 3)]);

    assert!(matches!(client.next_event().await, OutboundEvent::Connected { .. }));
    let (tokens, terminal) = client.until_terminal().await;
    assert_eq!(tokens, ["world", "again", "Hello"]);
    assert_eq!(finish_reason(&terminal), "length");

    let OutboundEvent::Complete { conversation, .. } = terminal else {
        unreachable!()
    };
    assert_eq!(conversation.title, "Hello");
    let messages = h.store.get_conversation_messages(conversation.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "worldagainHello");
}

#[tokio::test]
async fn stop_before_the_first_token_persists_only_the_prompt() {
    let h = harness(TestSource::new());
    let mut client = connect(
        &h.state,
        "tiny-gpt",
        ChatMode::Text,
        &[&generate("Hello", 5), STOP],
    );

    let (tokens, terminal) = client.until_terminal().await;
    assert!(tokens.is_empty());
    assert_eq!(finish_reason(&terminal), "cancelled");
    assert_eq!(h.store.message_count(), 1);
}

#[tokio::test]
async fn stop_mid_stream_discards_the_partial_reply() {
    let h = harness(TestSource::new().slow_steps(Duration::from_millis(20)));
    let mut client = connect(&h.state, "tiny-gpt", ChatMode::Text, &[&generate("Hello", 200)]);

    loop {
        if let OutboundEvent::Token { .. } = client.next_event().await {
            break;
        }
    }
    client.send(STOP).await;

    let (tokens, terminal) = client.until_terminal().await;
    assert_eq!(finish_reason(&terminal), "cancelled");
    assert!(tokens.len() < 50);
    assert_eq!(h.store.message_count(), 1);

    // The session is idle again and accepts the next prompt.
    client.send(&generate("Hello", 2)).await;
    let (tokens, terminal) = client.until_terminal().await;
    assert_eq!(tokens.len(), 2);
    assert_eq!(finish_reason(&terminal), "length");
}

#[tokio::test]
async fn out_of_band_stop_cancels_the_generation() {
    let h = harness(TestSource::new().slow_steps(Duration::from_millis(20)));
    let mut client = connect(&h.state, "tiny-gpt", ChatMode::Text, &[&generate("Hello", 200)]);

    loop {
        if let OutboundEvent::Token { .. } = client.next_event().await {
            break;
        }
    }
    assert!(h.state.sessions.request_stop(client.session_id).unwrap());

    let (_, terminal) = client.until_terminal().await;
    assert_eq!(finish_reason(&terminal), "cancelled");
    assert_eq!(h.store.message_count(), 1);
}

#[tokio::test]
async fn disconnect_is_treated_as_cancellation() {
    let h = harness(TestSource::new().slow_steps(Duration::from_millis(20)));
    let mut client = connect(&h.state, "tiny-gpt", ChatMode::Text, &[&generate("Hello", 200)]);

    loop {
        if let OutboundEvent::Token { .. } = client.next_event().await {
            break;
        }
    }
    let session_id = client.session_id;
    drop(client.inbound);

    tokio::time::timeout(Duration::from_secs(5), client.task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.store.message_count(), 1);
    assert!(h.state.sessions.state(session_id).is_none());
    assert!(h.state.sessions.is_empty());
}

#[tokio::test]
async fn client_that_stops_reading_is_dropped() {
    let h = harness_with(TestSource::new(), |config| config.outbound_buffer = 4);
    let client = connect(&h.state, "tiny-gpt", ChatMode::Text, &[&generate("Hello", 200)]);

    // Nothing drains `client.events`, so the queue fills after a few tokens.
    tokio::time::timeout(Duration::from_secs(5), client.task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.store.message_count(), 1);
    assert!(h.state.sessions.is_empty());
}

#[tokio::test]
async fn second_generate_is_rejected_while_busy() {
    let h = harness(TestSource::new().slow_steps(Duration::from_millis(10)));
    let mut client = connect(
        &h.state,
        "tiny-gpt",
        ChatMode::Text,
        &[&generate("Hello", 4), &generate("again", 4)],
    );

    let mut errors = Vec::new();
    let mut tokens = 0;
    let terminal = loop {
        match client.next_event().await {
            OutboundEvent::Connected { .. } => {}
            OutboundEvent::Token { .. } => tokens += 1,
            OutboundEvent::Error { error } => errors.push(error),
            terminal => break terminal,
        }
    };
    assert_eq!(errors, ["a generation is already in progress"]);
    assert_eq!(tokens, 4);
    assert_eq!(finish_reason(&terminal), "length");
    assert_eq!(h.store.message_count(), 2);
}

#[tokio::test]
async fn unknown_commands_keep_the_session_open() {
    let h = harness(TestSource::new());
    let mut client = connect(
        &h.state,
        "tiny-gpt",
        ChatMode::Text,
        &[r#"{"command":"dance"}"#, &generate("Hello", 1)],
    );

    let (_, terminal) = client.until_terminal().await;
    assert_eq!(error_text(&terminal), "Unknown command: dance");
    let (tokens, terminal) = client.until_terminal().await;
    assert_eq!(tokens, ["world"]);
    assert_eq!(finish_reason(&terminal), "length");
}

#[tokio::test]
async fn follow_up_prompts_continue_the_conversation() {
    let h = harness(TestSource::new());
    let mut client = connect(&h.state, "tiny-gpt", ChatMode::Text, &[&generate("Hello", 2)]);

    let (_, terminal) = client.until_terminal().await;
    let OutboundEvent::Complete { conversation, .. } = terminal else {
        panic!("expected completion, got {terminal:?}");
    };

    let follow_up = json!({
        "command": "generate",
        "message": "again",
        "chat_id": conversation.id,
        "max_length": 2,
        "temperature": 0.0,
    });
    client.send(&follow_up.to_string()).await;
    let (_, terminal) = client.until_terminal().await;
    let OutboundEvent::Complete {
        conversation: second,
        ..
    } = terminal
    else {
        panic!("expected completion, got {terminal:?}");
    };

    assert_eq!(second.id, conversation.id);
    assert_eq!(h.store.message_count(), 4);
}

#[tokio::test]
async fn unknown_conversation_is_reported() {
    let h = harness(TestSource::new());
    let frame = json!({ "command": "generate", "message": "Hello", "chat_id": 999 });
    let mut client = connect(&h.state, "tiny-gpt", ChatMode::Text, &[&frame.to_string()]);

    let (_, terminal) = client.until_terminal().await;
    assert_eq!(error_text(&terminal), "Conversation not found");
    assert_eq!(h.store.message_count(), 0);
}

#[tokio::test]
async fn oversized_prompts_are_rejected_before_persisting() {
    let h = harness(TestSource::new());
    let long = "Hello ".repeat(1_000);
    let mut client = connect(&h.state, "tiny-gpt", ChatMode::Text, &[&generate(&long, 3)]);

    let (_, terminal) = client.until_terminal().await;
    assert!(error_text(&terminal).starts_with("prompt too long"));
    assert_eq!(h.store.message_count(), 0);
}

#[tokio::test]
async fn unknown_backend_is_reported_and_the_session_stays_open() {
    let h = harness(TestSource::new());
    let mut client = connect(&h.state, "missing", ChatMode::Text, &[]);

    let (_, terminal) = client.until_terminal().await;
    assert_eq!(error_text(&terminal), "Model missing not registered");

    client.send(&generate("Hello", 2)).await;
    let (_, terminal) = client.until_terminal().await;
    assert_eq!(error_text(&terminal), "Model missing not registered");
    assert!(h.state.sessions.state(client.session_id).is_some());
    assert!(!client.task.is_finished());
    assert_eq!(h.source.loads(), 0);
    assert_eq!(h.store.message_count(), 0);
}

#[tokio::test]
async fn failed_load_is_retried_by_the_next_generate() {
    let h = harness(TestSource::new());
    h.source.fail.store(true, Ordering::SeqCst);
    let mut client = connect(&h.state, "tiny-gpt", ChatMode::Text, &[]);

    let (_, terminal) = client.until_terminal().await;
    assert!(error_text(&terminal).contains("tiny-gpt"));

    h.source.fail.store(false, Ordering::SeqCst);
    client.send(&generate("Hello", 2)).await;
    let (tokens, terminal) = client.until_terminal().await;
    assert_eq!(tokens, ["world", "again"]);
    assert_eq!(finish_reason(&terminal), "length");
    assert_eq!(h.source.loads(), 1);
}

#[tokio::test]
async fn vision_requires_an_image_reference() {
    let h = harness(TestSource::new());
    let mut client = connect(
        &h.state,
        "tiny-vision",
        ChatMode::Vision,
        &[&generate("What is this?", 3)],
    );

    let (_, terminal) = client.until_terminal().await;
    assert!(error_text(&terminal).contains("requires an image"));
    assert_eq!(h.store.message_count(), 0);
}

#[tokio::test]
async fn vision_chat_refuses_text_only_backends() {
    let h = harness(TestSource::new());
    let mut client = connect(&h.state, "tiny-gpt", ChatMode::Vision, &[]);

    let (_, terminal) = client.until_terminal().await;
    assert_eq!(
        error_text(&terminal),
        "Model tiny-gpt does not support vision capabilities"
    );
    tokio::time::timeout(Duration::from_secs(5), client.task)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn vision_generation_records_the_image() {
    let h = harness(TestSource::new());
    std::fs::write(h.state.config.uploads_dir.join("cat.png"), b"png").unwrap();
    let frame = json!({
        "command": "generate",
        "message": "What is this?",
        "image_url": "cat.png",
        "max_length": 2,
        "temperature": 0.0,
    });
    let mut client = connect(&h.state, "tiny-vision", ChatMode::Vision, &[&frame.to_string()]);

    let (tokens, terminal) = client.until_terminal().await;
    assert_eq!(tokens.len(), 2);
    let OutboundEvent::Complete { conversation, .. } = terminal else {
        panic!("expected completion, got {terminal:?}");
    };
    assert_eq!(conversation.title, VISION_CHAT_TITLE);

    let messages = h.store.get_conversation_messages(conversation.id).await.unwrap();
    assert_eq!(messages[0].image_url.as_deref(), Some("cat.png"));
    assert_eq!(messages.len(), 2);
}

#[tokio::test]
async fn vision_rejects_paths_outside_uploads() {
    let h = harness(TestSource::new());
    let frame = json!({
        "command": "generate",
        "message": "What is this?",
        "image_url": "../etc/passwd",
    });
    let mut client = connect(&h.state, "tiny-vision", ChatMode::Vision, &[&frame.to_string()]);

    let (_, terminal) = client.until_terminal().await;
    assert!(error_text(&terminal).contains("inside the uploads directory"));
    assert_eq!(h.store.message_count(), 0);
}
