mod common;

use roomshard::engine::chat::{muffle_speech, ChatEvent, ChatKind, OutgoingChat};
use roomshard::engine::modifiers::{ModifierConfig, ModifierType};
use roomshard::engine::protocol::ChatResponse;
use roomshard::engine::{ClientRequest, NewModifier, ServerMessage, ServerResponse};

fn say(text: &str) -> OutgoingChat {
    OutgoingChat {
        kind: ChatKind::Say,
        text: text.into(),
        to: None,
    }
}

fn chat(messages: Vec<OutgoingChat>) -> ClientRequest {
    ClientRequest::Chat { messages }
}

fn add_modifier(sync: &mut roomshard::engine::SpaceSynchronizer, who: &str, modifier: NewModifier) {
    let response = sync.handle_request(
        &who.into(),
        ClientRequest::CharacterModifierAdd {
            target: who.into(),
            modifier,
        },
        0,
    );
    assert!(matches!(response, ServerResponse::Modifier(_)), "{:?}", response);
}

fn received(messages: &[ServerMessage]) -> Vec<(String, String)> {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::Chat { messages } => messages.iter().find_map(|event| match event {
                ChatEvent::Message { from_name, text, .. } => Some((from_name.clone(), text.clone())),
                _ => None,
            }),
            _ => None,
        })
        .collect()
}

#[test]
fn banned_word_matches_whole_words_ignoring_case() {
    let mut sync = common::space("s1");
    let _alice = common::join(&mut sync, "a", "Alice");
    let mut bob = common::join(&mut sync, "b", "Bob");
    add_modifier(
        &mut sync,
        "a",
        NewModifier::new(ModifierType::SpeechBanWords).with_config(ModifierConfig::Words {
            words: vec!["no".into()],
        }),
    );
    common::drain(&mut bob);

    let blocked = sync.handle_request(&"a".into(), chat(vec![say("NO, not today")]), 1);
    assert!(matches!(
        blocked,
        ServerResponse::Chat(ChatResponse::Blocked { .. })
    ));
    assert!(received(&common::drain(&mut bob)).is_empty());

    let allowed = sync.handle_request(&"a".into(), chat(vec![say("nonetheless")]), 2);
    assert_eq!(allowed, ServerResponse::Chat(ChatResponse::Sent { count: 1 }));
    assert_eq!(
        received(&common::drain(&mut bob)),
        vec![("Alice".to_string(), "nonetheless".to_string())]
    );
}

#[test]
fn ooc_is_not_subject_to_speech_bans() {
    let mut sync = common::space("s1");
    let _alice = common::join(&mut sync, "a", "Alice");
    add_modifier(
        &mut sync,
        "a",
        NewModifier::new(ModifierType::SpeechBanWords).with_config(ModifierConfig::Words {
            words: vec!["no".into()],
        }),
    );
    let ooc = OutgoingChat {
        kind: ChatKind::Ooc,
        text: "no worries".into(),
        to: None,
    };
    assert_eq!(
        sync.handle_request(&"a".into(), chat(vec![ooc]), 1),
        ServerResponse::Chat(ChatResponse::Sent { count: 1 })
    );
}

#[test]
fn speech_muffling_is_deterministic() {
    let text = "Please let me go";
    assert_eq!(muffle_speech(text, 7, 42), muffle_speech(text, 7, 42));
    assert_ne!(muffle_speech(text, 10, 42), text);
    assert_eq!(muffle_speech(text, 0, 42), text);
    // Punctuation and spacing survive
    assert_eq!(
        muffle_speech(text, 10, 9).split(' ').count(),
        text.split(' ').count()
    );
}

#[test]
fn deaf_listener_and_blind_viewer_get_their_own_copy() {
    let mut sync = common::space("s1");
    let _alice = common::join(&mut sync, "a", "Alice");
    let mut bob = common::join(&mut sync, "b", "Bob");
    let mut carol = common::join(&mut sync, "c", "Carol");
    add_modifier(
        &mut sync,
        "b",
        NewModifier::new(ModifierType::EffectDeaf).with_config(ModifierConfig::Intensity {
            intensity: 10,
            max_intensity: 10,
        }),
    );
    add_modifier(
        &mut sync,
        "c",
        NewModifier::new(ModifierType::EffectBlind).with_config(ModifierConfig::Intensity {
            intensity: 10,
            max_intensity: 10,
        }),
    );
    common::drain(&mut bob);
    common::drain(&mut carol);

    sync.handle_request(&"a".into(), chat(vec![say("hello")]), 1);
    assert_eq!(received(&common::drain(&mut bob)), vec![("Alice".to_string(), ".....".to_string())]);
    assert_eq!(received(&common::drain(&mut carol)), vec![("Alice".to_string(), "hello".to_string())]);

    let wave = OutgoingChat {
        kind: ChatKind::Emote,
        text: "waves".into(),
        to: None,
    };
    sync.handle_request(&"a".into(), chat(vec![wave]), 2);
    let seen = received(&common::drain(&mut carol));
    assert_eq!(seen.len(), 1);
    assert_ne!(seen[0].0, "Alice");
    assert_eq!(seen[0].1, "waves");
    assert_eq!(received(&common::drain(&mut bob))[0].0, "Alice");
}

#[test]
fn overlong_and_empty_messages_are_rejected() {
    let mut sync = common::space("s1");
    let _alice = common::join(&mut sync, "a", "Alice");
    let long = "x".repeat(1_001);
    assert_eq!(
        sync.handle_request(&"a".into(), chat(vec![say(&long)]), 0),
        ServerResponse::Chat(ChatResponse::TooLong { max: 1_000 })
    );
    assert_eq!(
        sync.handle_request(&"a".into(), chat(vec![say("   ")]), 0),
        ServerResponse::Chat(ChatResponse::Empty)
    );
}

#[test]
fn reconnect_replay_keeps_hearing_filters() {
    let mut sync = common::space("s1");
    let _alice = common::join(&mut sync, "a", "Alice");
    let mut bob = common::join(&mut sync, "b", "Bob");
    add_modifier(
        &mut sync,
        "b",
        NewModifier::new(ModifierType::HearingCensorWords).with_config(ModifierConfig::Words {
            words: vec!["secret".into()],
        }),
    );
    common::drain(&mut bob);

    sync.handle_request(&"a".into(), chat(vec![say("the secret plan")]), 1);
    assert_eq!(
        received(&common::drain(&mut bob)),
        vec![("Alice".to_string(), "the ****** plan".to_string())]
    );

    sync.disconnect(&"b".into(), 2);
    let (tx, mut bob) = tokio::sync::mpsc::unbounded_channel();
    assert!(sync.connect(&"b".into(), tx, 3));
    assert_eq!(
        received(&common::drain(&mut bob)),
        vec![("Alice".to_string(), "the ****** plan".to_string())]
    );
}
