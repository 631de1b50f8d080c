// Integration tests for the chat session controller
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

mod common;
use common::{
    wait_for, wait_for_selection, wait_until, FaultyStore, Script, ScriptedModerator,
    TestWorld,
};

use chitchathub::models::conversation_id;
use chitchathub::moderation::{ModerationVerdict, UnavailableModerator};
use chitchathub::session::{
    AddContactError, ChatSession, NoticeLevel, RemoveContactError, SendError, SendFailure,
    SendOutcome, SendState, SessionEvent, SessionOptions, GENERIC_REJECTION,
};
use chitchathub::store::{ContactStore, MessageStream};

fn notice_titled(title: &'static str) -> impl FnMut(&SessionEvent) -> bool {
    move |event| matches!(event, SessionEvent::Notice(notice) if notice.title == title)
}

// ============================================================================
// Contact selection
// ============================================================================

#[tokio::test]
async fn test_session_without_contacts_selects_nothing() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;

    let (session, _events) = world.start(alice, ScriptedModerator::new()).await;
    assert!(session.contacts().is_empty());
    assert!(session.selected_contact().is_none());
    assert!(session.conversation_id().is_none());
    assert!(session.messages().is_empty());
}

#[tokio::test]
async fn test_first_contact_is_selected_and_kept() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let bob = world.register("Bob").await;
    let carol = world.register("Carol").await;
    let alice_id = alice.id().to_string();
    let bob_id = bob.id().to_string();

    let (session, _events) = world.start(alice, ScriptedModerator::new()).await;
    session.add_contact("bob@example.com").await.unwrap();
    assert!(wait_for_selection(&session, Some(&bob_id)).await);
    assert_eq!(session.conversation_id(), Some(conversation_id(&alice_id, &bob_id)));

    session.add_contact("carol@example.com").await.unwrap();
    assert!(wait_until(|| session.contacts().len() == 2).await);
    // The existing selection survives the new contact
    assert_eq!(session.selected_contact().unwrap().id, bob_id);

    session.select_contact(carol.id()).await.unwrap();
    assert_eq!(
        session.conversation_id(),
        Some(conversation_id(&alice_id, carol.id()))
    );
}

#[tokio::test]
async fn test_select_unknown_contact_fails() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let stranger = world.register("Stranger").await;

    let (session, _events) = world.start(alice, ScriptedModerator::new()).await;
    assert!(session.select_contact(stranger.id()).await.is_err());
    assert!(session.selected_contact().is_none());
}

#[tokio::test]
async fn test_removing_selected_contact_moves_selection() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let bob = world.register("Bob").await;
    let carol = world.register("Carol").await;
    let alice_id = alice.id().to_string();

    let (session, _events) = world.start(alice, ScriptedModerator::new()).await;
    session.add_contact("bob@example.com").await.unwrap();
    session.add_contact("carol@example.com").await.unwrap();
    assert!(wait_until(|| session.contacts().len() == 2).await);
    assert!(wait_for_selection(&session, Some(bob.id())).await);

    // Bob removes Alice from his side; both directions go away
    world.store.remove_contact_pair(bob.id(), &alice_id).await.unwrap();
    assert!(wait_for_selection(&session, Some(carol.id())).await);
    assert_eq!(session.contacts().len(), 1);
}

#[tokio::test]
async fn test_removing_only_contact_clears_selection() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let bob = world.register("Bob").await;
    let conversation = conversation_id(alice.id(), bob.id());

    let (session, _events) = world.start(alice, ScriptedModerator::new()).await;
    session.add_contact("bob@example.com").await.unwrap();
    assert!(wait_for_selection(&session, Some(bob.id())).await);
    assert!(wait_until(|| world.store.message_views().active(&conversation) == 1).await);

    session.remove_contact(bob.id()).await.unwrap();
    assert!(wait_for_selection(&session, None).await);
    assert!(session.contacts().is_empty());
    assert!(session.conversation_id().is_none());
    assert!(session.messages().is_empty());
    assert!(wait_until(|| world.store.message_views().active(&conversation) == 0).await);

    // Bob's side is gone as well
    assert!(world.store.contact_ids(bob.id()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_remove_lookup_failure_is_reported() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let bob = world.register("Bob").await;
    let store = FaultyStore::new(world.store.clone());

    let (session, mut events) = ChatSession::start(
        alice,
        store.clone(),
        ScriptedModerator::new(),
        SessionOptions::default(),
    )
    .await
    .unwrap();
    session.add_contact("bob@example.com").await.unwrap();
    assert!(wait_for_selection(&session, Some(bob.id())).await);

    store.fail_contact_lookups(true);
    let err = session.remove_contact(bob.id()).await.unwrap_err();
    assert!(matches!(err, RemoveContactError::Store(_)));
    let event = wait_for(&mut events, notice_titled("Error")).await;
    assert!(
        matches!(event, SessionEvent::Notice(ref n) if n.description == "Failed to remove contact. Please try again.")
    );

    // Nothing was removed
    store.fail_contact_lookups(false);
    assert_eq!(session.contacts().len(), 1);
    assert_eq!(world.store.contact_ids(bob.id()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_remove_non_contact_is_refused() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let bob = world.register("Bob").await;

    let (session, _events) = world.start(alice, ScriptedModerator::new()).await;
    let err = session.remove_contact(bob.id()).await.unwrap_err();
    assert!(matches!(err, RemoveContactError::NotAContact(_)));
}

#[tokio::test]
async fn test_switching_contacts_keeps_one_message_feed() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let bob = world.register("Bob").await;
    let carol = world.register("Carol").await;
    let with_bob = conversation_id(alice.id(), bob.id());
    let with_carol = conversation_id(alice.id(), carol.id());

    let (session, _events) = world.start(alice, ScriptedModerator::new()).await;
    session.add_contact("bob@example.com").await.unwrap();
    session.add_contact("carol@example.com").await.unwrap();
    assert!(wait_until(|| session.contacts().len() == 2).await);

    for _ in 0..3 {
        session.select_contact(carol.id()).await.unwrap();
        session.select_contact(bob.id()).await.unwrap();
    }
    session.select_contact(carol.id()).await.unwrap();

    assert!(wait_until(|| world.store.message_views().active(&with_bob) == 0).await);
    assert_eq!(world.store.message_views().active(&with_carol), 1);
}

// ============================================================================
// Adding contacts
// ============================================================================

#[tokio::test]
async fn test_add_contact_notices() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let alice_id = alice.id().to_string();
    world.register("Bob").await;

    let (session, mut events) = world.start(alice, ScriptedModerator::new()).await;

    let err = session.add_contact("nobody@example.com").await.unwrap_err();
    assert!(matches!(err, AddContactError::NotFound(_)));
    wait_for(&mut events, notice_titled("User not found")).await;
    assert!(world.store.contact_ids(&alice_id).await.unwrap().is_empty());

    let err = session.add_contact("alice@example.com").await.unwrap_err();
    assert!(matches!(err, AddContactError::SelfAdd));
    wait_for(&mut events, notice_titled("Cannot add yourself")).await;
    assert!(world.store.contact_ids(&alice_id).await.unwrap().is_empty());

    let added = session.add_contact("BOB@example.com").await.unwrap();
    assert_eq!(added.name, "Bob");
    let event = wait_for(&mut events, notice_titled("Contact added")).await;
    match event {
        SessionEvent::Notice(notice) => {
            assert_eq!(notice.level, NoticeLevel::Info);
            assert_eq!(notice.description, "Bob was added to your chat list.");
        }
        other => panic!("unexpected event {:?}", other),
    }

    let err = session.add_contact("bob@example.com").await.unwrap_err();
    assert!(matches!(err, AddContactError::AlreadyContact(_)));
    wait_for(&mut events, notice_titled("User already in list")).await;
}

#[tokio::test]
async fn test_add_contact_with_blank_email() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;

    let (session, _events) = world.start(alice, ScriptedModerator::new()).await;
    let err = session.add_contact("   ").await.unwrap_err();
    assert!(matches!(err, AddContactError::InvalidEmail));
}

// ============================================================================
// Sending messages
// ============================================================================

#[tokio::test]
async fn test_send_filters_before_moderation() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let bob = world.register("Bob").await;
    let moderator = ScriptedModerator::new();

    let (session, _events) = world.start(alice, moderator.clone()).await;
    session.add_contact("bob@example.com").await.unwrap();
    assert!(wait_for_selection(&session, Some(bob.id())).await);

    let outcome = session.send_message("  this is terrible  ").await.unwrap();
    let sent = match outcome {
        SendOutcome::Sent(message) => message,
        other => panic!("expected a sent message, got {:?}", other),
    };
    assert_eq!(sent.text, "this is ********");
    assert_eq!(moderator.seen(), vec!["this is ********".to_string()]);
    assert_eq!(session.send_state(), SendState::Idle);

    assert!(wait_until(|| session.messages().len() == 1).await);
    assert_eq!(session.messages()[0].text, "this is ********");
}

#[tokio::test]
async fn test_unsafe_message_is_not_appended() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let bob = world.register("Bob").await;
    let conversation = conversation_id(alice.id(), bob.id());
    let moderator = ScriptedModerator::with(vec![
        Script::Verdict(ModerationVerdict::unsafe_because("Harassment")),
        Script::Verdict(ModerationVerdict {
            is_safe: false,
            reason: None,
        }),
    ]);

    let (session, mut events) = world.start(alice, moderator).await;
    session.add_contact("bob@example.com").await.unwrap();
    assert!(wait_for_selection(&session, Some(bob.id())).await);

    let outcome = session.send_message("you are awful").await.unwrap();
    assert_eq!(
        outcome,
        SendOutcome::Rejected {
            reason: Some("Harassment".to_string())
        }
    );
    wait_for(&mut events, |e| *e == SessionEvent::SendStateChanged(SendState::Rejected)).await;
    let event = wait_for(&mut events, notice_titled("Message not sent")).await;
    assert!(matches!(event, SessionEvent::Notice(ref n) if n.description == "Harassment"));
    wait_for(&mut events, |e| *e == SessionEvent::SendStateChanged(SendState::Idle)).await;

    let outcome = session.send_message("again").await.unwrap();
    assert_eq!(outcome, SendOutcome::Rejected { reason: None });
    let event = wait_for(&mut events, notice_titled("Message not sent")).await;
    assert!(matches!(event, SessionEvent::Notice(ref n) if n.description == GENERIC_REJECTION));

    assert_eq!(session.send_state(), SendState::Idle);
    assert!(world.store.messages(&conversation).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_moderation_error_fails_closed() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let bob = world.register("Bob").await;
    let conversation = conversation_id(alice.id(), bob.id());
    let moderator = ScriptedModerator::with(vec![Script::Fail("connection refused".to_string())]);

    let (session, mut events) = world.start(alice, moderator).await;
    session.add_contact("bob@example.com").await.unwrap();
    assert!(wait_for_selection(&session, Some(bob.id())).await);

    let outcome = session.send_message("hello").await.unwrap();
    assert!(matches!(outcome, SendOutcome::Failed(SendFailure::Moderation(_))));
    let event = wait_for(&mut events, notice_titled("Error")).await;
    assert!(
        matches!(event, SessionEvent::Notice(ref n) if n.description == "Failed to send message. Please try again.")
    );
    assert_eq!(session.send_state(), SendState::Idle);
    assert!(world.store.messages(&conversation).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unconfigured_moderation_refuses_to_send() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let bob = world.register("Bob").await;

    let (session, _events) = world
        .start(alice, Arc::new(UnavailableModerator::new("no key")))
        .await;
    session.add_contact("bob@example.com").await.unwrap();
    assert!(wait_for_selection(&session, Some(bob.id())).await);

    let outcome = session.send_message("hello").await.unwrap();
    assert!(matches!(outcome, SendOutcome::Failed(SendFailure::Moderation(_))));
}

#[tokio::test]
async fn test_moderation_timeout_returns_to_idle() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let bob = world.register("Bob").await;
    let conversation = conversation_id(alice.id(), bob.id());
    let moderator = ScriptedModerator::with(vec![Script::Hang]);
    let options = SessionOptions {
        moderation_timeout: Duration::from_millis(50),
    };

    let (session, _events) = ChatSession::start(alice, world.store.clone(), moderator, options)
        .await
        .unwrap();
    session.add_contact("bob@example.com").await.unwrap();
    assert!(wait_for_selection(&session, Some(bob.id())).await);

    let outcome = session.send_message("hello").await.unwrap();
    assert_eq!(outcome, SendOutcome::Failed(SendFailure::ModerationTimedOut));
    assert_eq!(session.send_state(), SendState::Idle);
    assert!(world.store.messages(&conversation).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_append_failure_is_reported() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let bob = world.register("Bob").await;
    let store = FaultyStore::new(world.store.clone());
    store.fail_appends(true);

    let (session, mut events) = ChatSession::start(
        alice,
        store.clone(),
        ScriptedModerator::new(),
        SessionOptions::default(),
    )
    .await
    .unwrap();
    session.add_contact("bob@example.com").await.unwrap();
    assert!(wait_for_selection(&session, Some(bob.id())).await);

    let outcome = session.send_message("hello").await.unwrap();
    assert!(matches!(outcome, SendOutcome::Failed(SendFailure::Append(_))));
    wait_for(&mut events, notice_titled("Error")).await;
    assert_eq!(session.send_state(), SendState::Idle);
}

#[tokio::test]
async fn test_send_refused_up_front() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let bob = world.register("Bob").await;
    let moderator = ScriptedModerator::new();

    let (session, _events) = world.start(alice, moderator.clone()).await;
    assert_eq!(session.send_message("hello").await, Err(SendError::NoConversation));

    session.add_contact("bob@example.com").await.unwrap();
    assert!(wait_for_selection(&session, Some(bob.id())).await);
    assert_eq!(session.send_message("   ").await, Err(SendError::Empty));
    assert!(moderator.seen().is_empty());
}

#[tokio::test]
async fn test_second_send_while_busy_is_refused() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let bob = world.register("Bob").await;
    let release = Arc::new(Notify::new());
    let moderator = ScriptedModerator::with(vec![Script::Wait(
        release.clone(),
        ModerationVerdict::safe(),
    )]);

    let (session, _events) = world.start(alice, moderator.clone()).await;
    let session = Arc::new(session);
    session.add_contact("bob@example.com").await.unwrap();
    assert!(wait_for_selection(&session, Some(bob.id())).await);

    let first = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.send_message("first").await })
    };
    assert!(wait_until(|| session.send_state() == SendState::Moderating).await);

    assert_eq!(session.send_message("second").await, Err(SendError::Busy));

    release.notify_one();
    let outcome = first.await.unwrap().unwrap();
    assert!(matches!(outcome, SendOutcome::Sent(ref m) if m.text == "first"));
    assert_eq!(moderator.seen(), vec!["first".to_string()]);
    assert_eq!(session.send_state(), SendState::Idle);
}

#[tokio::test]
async fn test_send_walks_through_states() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let bob = world.register("Bob").await;

    let (session, mut events) = world.start(alice, ScriptedModerator::new()).await;
    session.add_contact("bob@example.com").await.unwrap();
    assert!(wait_for_selection(&session, Some(bob.id())).await);

    session.send_message("hi").await.unwrap();
    for state in [
        SendState::Filtering,
        SendState::Moderating,
        SendState::Appending,
        SendState::Idle,
    ] {
        wait_for(&mut events, |e| *e == SessionEvent::SendStateChanged(state)).await;
    }
}

// ============================================================================
// Conversation feed
// ============================================================================

#[tokio::test]
async fn test_messages_from_both_sides_arrive() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let bob = world.register("Bob").await;
    let alice_id = alice.id().to_string();

    let (alice_session, _alice_events) = world.start(alice, ScriptedModerator::new()).await;
    let (bob_session, _bob_events) = world.start(bob, ScriptedModerator::new()).await;

    let bob_profile = alice_session.add_contact("bob@example.com").await.unwrap();
    assert!(wait_for_selection(&alice_session, Some(&bob_profile.id)).await);
    assert!(wait_for_selection(&bob_session, Some(&alice_id)).await);
    assert_eq!(alice_session.conversation_id(), bob_session.conversation_id());

    alice_session.send_message("hello bob").await.unwrap();
    bob_session.send_message("hi alice").await.unwrap();

    for session in [&alice_session, &bob_session] {
        assert!(wait_until(|| session.messages().len() == 2).await);
        let texts: Vec<String> = session.messages().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["hello bob".to_string(), "hi alice".to_string()]);
    }
}

#[tokio::test]
async fn test_avatar_change_does_not_rewrite_history() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let bob = world.register("Bob").await;
    let old_avatar = alice.profile.avatar_url.clone();
    let conversation = conversation_id(alice.id(), bob.id());

    let (session, mut events) = world.start(alice, ScriptedModerator::new()).await;
    session.add_contact("bob@example.com").await.unwrap();
    assert!(wait_for_selection(&session, Some(bob.id())).await);

    session.send_message("before").await.unwrap();
    let updated = session
        .update_avatar("https://example.com/alice.png")
        .await
        .unwrap();
    assert_eq!(updated.avatar_url, "https://example.com/alice.png");
    wait_for(&mut events, notice_titled("Profile Updated")).await;
    assert_eq!(session.profile().avatar_url, "https://example.com/alice.png");

    session.send_message("after").await.unwrap();
    let stored = world.store.messages(&conversation).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].sender.avatar_url, old_avatar);
    assert_eq!(stored[1].sender.avatar_url, "https://example.com/alice.png");
}

#[tokio::test]
async fn test_empty_avatar_is_refused() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;

    let (session, _events) = world.start(alice, ScriptedModerator::new()).await;
    assert!(session.update_avatar("  ").await.is_err());
}

#[tokio::test]
async fn test_search_filters_open_conversation() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let bob = world.register("Bob").await;

    let (session, _events) = world.start(alice, ScriptedModerator::new()).await;
    session.add_contact("bob@example.com").await.unwrap();
    assert!(wait_for_selection(&session, Some(bob.id())).await);

    for text in ["Lunch tomorrow?", "sure", "Where for LUNCH"] {
        session.send_message(text).await.unwrap();
    }
    assert!(wait_until(|| session.messages().len() == 3).await);

    let hits: Vec<String> = session
        .search_messages("lunch")
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert_eq!(hits, vec!["Lunch tomorrow?".to_string(), "Where for LUNCH".to_string()]);
    assert_eq!(session.search_messages("").len(), 3);
    assert!(session.search_messages("dinner").is_empty());
}

#[tokio::test]
async fn test_search_keeps_whitespace_in_query() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let bob = world.register("Bob").await;

    let (session, _events) = world.start(alice, ScriptedModerator::new()).await;
    session.add_contact("bob@example.com").await.unwrap();
    assert!(wait_for_selection(&session, Some(bob.id())).await);

    for text in ["a  b", "ab"] {
        session.send_message(text).await.unwrap();
    }
    assert!(wait_until(|| session.messages().len() == 2).await);

    let hits: Vec<String> = session
        .search_messages("  ")
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert_eq!(hits, vec!["a  b".to_string()]);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_sign_out_closes_session_and_releases_subscriptions() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let bob = world.register("Bob").await;
    let alice_id = alice.id().to_string();
    let conversation = conversation_id(alice.id(), bob.id());

    let (session, mut events) = world.start(alice, ScriptedModerator::new()).await;
    session.add_contact("bob@example.com").await.unwrap();
    assert!(wait_for_selection(&session, Some(bob.id())).await);
    assert!(world.store.contact_views().is_watched(&alice_id));

    world.auth.sign_out(&alice_id).await.unwrap();
    wait_for(&mut events, |e| *e == SessionEvent::SignedOut).await;
    assert!(session.is_closed());
    assert!(wait_until(|| world.store.contact_views().active(&alice_id) == 0).await);
    assert!(wait_until(|| world.store.message_views().active(&conversation) == 0).await);

    assert_eq!(session.send_message("hello").await, Err(SendError::Closed));
    assert!(matches!(
        session.add_contact("bob@example.com").await,
        Err(AddContactError::Closed)
    ));
}

#[tokio::test]
async fn test_dropping_session_releases_subscriptions() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let bob = world.register("Bob").await;
    let alice_id = alice.id().to_string();
    let conversation = conversation_id(alice.id(), bob.id());

    let (session, _events) = world.start(alice, ScriptedModerator::new()).await;
    session.add_contact("bob@example.com").await.unwrap();
    assert!(wait_for_selection(&session, Some(bob.id())).await);

    drop(session);
    assert!(wait_until(|| world.store.contact_views().active(&alice_id) == 0).await);
    assert!(wait_until(|| world.store.message_views().active(&conversation) == 0).await);
}

#[tokio::test]
async fn test_start_after_sign_out_is_refused() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let alice_id = alice.id().to_string();

    world.auth.sign_out(&alice_id).await.unwrap();
    let result = ChatSession::start(
        alice,
        world.store.clone(),
        ScriptedModerator::new(),
        SessionOptions::default(),
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_contact_presence_reaches_the_session() {
    let world = TestWorld::new();
    let alice = world.register("Alice").await;
    let bob = world.register("Bob").await;
    let bob_id = bob.id().to_string();

    let (session, _events) = world.start(alice, ScriptedModerator::new()).await;
    session.add_contact("bob@example.com").await.unwrap();
    assert!(wait_until(|| session.selected_contact().map(|u| u.online) == Some(true)).await);

    world.auth.sign_out(&bob_id).await.unwrap();
    assert!(wait_until(|| session.selected_contact().map(|u| u.online) == Some(false)).await);
    assert!(!session.contacts()[0].online);
}
