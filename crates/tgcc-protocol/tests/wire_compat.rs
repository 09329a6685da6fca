// Verify the stdin wire format matches what the CLI expects.
// These tests ensure protocol compatibility is never broken.

use tgcc_protocol::outbound::{ContentBlock, ImageSource, Outbound, UserContent};

#[test]
fn user_text_round_trip() {
    let msg = Outbound::text("Run the tests, please.");
    let line = msg.to_line();
    let back: Outbound = serde_json::from_str(&line).unwrap();
    assert_eq!(back, msg);
}

#[test]
fn user_blocks_round_trip() {
    let msg = Outbound::blocks(vec![
        ContentBlock::Text {
            text: "What is in this screenshot?".to_string(),
        },
        ContentBlock::Image {
            source: ImageSource::base64("image/png", "aGVsbG8=".to_string()),
        },
    ]);
    let line = msg.to_line();
    let back: Outbound = serde_json::from_str(&line).unwrap();
    assert_eq!(back, msg);

    assert!(line.contains(r#""type":"image""#));
    assert!(line.contains(r#""type":"base64""#));
    assert!(line.contains(r#""media_type":"image/png""#));
}

#[test]
fn document_round_trip() {
    let msg = Outbound::document("/tmp/tgcc/media/a.csv", "a.csv");
    let back: Outbound = serde_json::from_str(&msg.to_line()).unwrap();
    assert_eq!(back, msg);

    // A document is a plain text message, not a content-block array.
    match back {
        Outbound::User { message, .. } => {
            assert!(matches!(message.content, UserContent::Text(_)));
        }
        other => panic!("expected user message, got {other:?}"),
    }
}

#[test]
fn initialize_round_trip() {
    let msg = Outbound::initialize("init-abc");
    let back: Outbound = serde_json::from_str(&msg.to_line()).unwrap();
    assert_eq!(back, msg);
}

#[test]
fn permission_response_round_trip() {
    for (allow, note) in [(true, None), (false, Some("user said no".to_string()))] {
        let msg = Outbound::permission_response("req-1", allow, note);
        let back: Outbound = serde_json::from_str(&msg.to_line()).unwrap();
        assert_eq!(back, msg);
    }
}

#[test]
fn every_message_gets_a_distinct_uuid() {
    let a = Outbound::text("one").to_line();
    let b = Outbound::text("one").to_line();
    assert_ne!(a, b, "uuid must differ between messages with equal bodies");
}
