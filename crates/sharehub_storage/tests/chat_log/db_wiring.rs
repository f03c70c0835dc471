#![forbid(unsafe_code)]

use sharehub_contracts::chat::{ChatMessageInput, CHAT_LOG_CAPACITY};
use sharehub_storage::{BoundedStore, MemoryBackend};

fn msg(body: &str) -> ChatMessageInput {
    ChatMessageInput {
        conversation_id: "conv_1".to_string(),
        sender_id: "u1".to_string(),
        body: body.to_string(),
    }
}

#[test]
fn at_chat_db_01_log_is_trimmed_to_newest_hundred() {
    let store = BoundedStore::new(MemoryBackend::new());
    for i in 0..105 {
        assert!(store.save_chat_message(msg(&format!("m{i}"))));
    }
    let messages = store.chat_messages();
    assert_eq!(messages.len(), CHAT_LOG_CAPACITY);
    assert_eq!(messages[0].body, "m5");
    assert_eq!(messages[CHAT_LOG_CAPACITY - 1].body, "m104");
}

#[test]
fn at_chat_db_02_blank_message_is_rejected() {
    let store = BoundedStore::new(MemoryBackend::new());
    assert!(!store.save_chat_message(msg("   ")));
    assert!(store.chat_messages().is_empty());
}

#[test]
fn at_chat_db_03_chat_log_is_not_evicted_as_non_essential() {
    let backend = MemoryBackend::new();
    let store = BoundedStore::with_budget(backend.clone(), 600);
    assert!(store.save_chat_message(msg("hello")));
    assert!(store.set_item("cache_blob", &"c".repeat(200)));
    assert!(store.set_item("user", &"u".repeat(300)));
    assert!(backend.raw_get("sharehub_chat_messages").is_some());
    assert!(backend.raw_get("sharehub_cache_blob").is_none());
}

#[test]
fn at_chat_db_04_clear_removes_log() {
    let store = BoundedStore::new(MemoryBackend::new());
    assert!(store.save_chat_message(msg("hello")));
    assert!(store.clear_chat_messages());
    assert!(store.chat_messages().is_empty());
}
