use chrono::{TimeZone, Utc};
use meshgram::mesh::{MeshPayload, MessageFactory, MessageKind, NodeId, ParseError, Route};

fn parse(topic: &str, body: &str) -> Result<meshgram::mesh::MeshMessage, ParseError> {
    MessageFactory::new().parse(topic, body.as_bytes())
}

#[test]
fn text_message_with_envelope_fields() {
    let msg = parse(
        "msh/EU_868/2/json/LongFast/!698535e0",
        r#"{"type":"text","id":123456,"from":2882400001,"to":4294967295,"channel":0,
            "rssi":-95,"snr":5.5,"hop_start":3,"hop_limit":1,"timestamp":1700000000,
            "payload":{"text":"hello mesh"}}"#,
    )
    .unwrap();

    assert_eq!(msg.kind(), MessageKind::Text);
    assert_eq!(msg.node_id.as_str(), "!abcdef01");
    assert_eq!(msg.gateway_id.as_ref().unwrap().as_str(), "!698535e0");
    assert_eq!(msg.packet_id, Some(123456));
    assert!(!msg.is_direct());
    assert_eq!(msg.channel, Some(0));
    assert_eq!(msg.link.rssi, Some(-95));
    assert_eq!(msg.link.snr, Some(5.5));
    assert_eq!(msg.link.hops_away, Some(2));
    assert_eq!(msg.timestamp, Utc.timestamp_opt(1_700_000_000, 0).single());
    assert_eq!(msg.route, Route::All);
    assert_eq!(
        msg.payload,
        MeshPayload::Text {
            text: "hello mesh".into()
        }
    );
}

#[test]
fn routing_prefix_is_kept_on_the_message() {
    let body = r#"{"type":"text","from":1,"payload":{"text":"hi"}}"#;
    let msg = parse("msh/private/555123/2/json/LongFast/!698535e0", body).unwrap();
    assert_eq!(msg.route, Route::Private(555123));
    assert_eq!(msg.gateway_id.as_ref().unwrap().as_str(), "!698535e0");

    let msg = parse("msh/private/555123/group/2/json/!698535e0", body).unwrap();
    assert_eq!(msg.route, Route::PrivateGroup(555123));

    let msg = parse("msh/group/EU_868/2/json/!698535e0", body).unwrap();
    assert_eq!(msg.route, Route::Group);
}

#[test]
fn node_id_falls_back_to_topic() {
    let msg = parse(
        "msh/2/json/!1",
        r#"{"type":"nodeinfo","payload":{"longname":"Base"}}"#,
    )
    .unwrap();
    assert_eq!(msg.node_id, NodeId::parse("!1").unwrap());
    match msg.payload {
        MeshPayload::NodeInfo(info) => assert_eq!(info.long_name.as_deref(), Some("Base")),
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn nodeinfo_accepts_field_name_variants() {
    let msg = parse(
        "msh/2/json/LongFast/!gw",
        r#"{"type":"nodeinfo","from":16,"payload":{"id":"!0000abcd","long_name":"Ridge","shortName":"RDG","hardware":9}}"#,
    )
    .unwrap();
    // the described node wins over the packet sender
    assert_eq!(msg.node_id.as_str(), "!0000abcd");
    match msg.payload {
        MeshPayload::NodeInfo(info) => {
            assert_eq!(info.long_name.as_deref(), Some("Ridge"));
            assert_eq!(info.short_name.as_deref(), Some("RDG"));
            assert_eq!(info.hardware.as_deref(), Some("RAK4631"));
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn telemetry_and_position_payloads() {
    let msg = parse(
        "msh/2/json/!1",
        r#"{"type":"telemetry","payload":{"battery":87,"voltage":4.05,"air_util_tx":1.5}}"#,
    )
    .unwrap();
    match msg.payload {
        MeshPayload::Telemetry(t) => {
            assert_eq!(t.battery_level, Some(87));
            assert_eq!(t.voltage, Some(4.05));
            assert_eq!(t.air_util_tx, Some(1.5));
            assert_eq!(t.temperature, None);
        }
        other => panic!("unexpected payload {:?}", other),
    }

    let msg = parse(
        "msh/2/json/!1",
        r#"{"type":"position","payload":{"latitude_i":557500000,"longitude_i":376200000}}"#,
    )
    .unwrap();
    match msg.payload {
        MeshPayload::Position(p) => {
            assert!((p.latitude - 55.75).abs() < 1e-9);
            assert!((p.longitude - 37.62).abs() < 1e-9);
            assert_eq!(p.altitude, None);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn direct_text_is_detected() {
    let msg = parse(
        "msh/2/json/!1",
        r#"{"type":"text","from":1,"to":2,"payload":{"text":"psst"}}"#,
    )
    .unwrap();
    assert!(msg.is_direct());
    assert_eq!(msg.to.unwrap().as_str(), "!00000002");
}

#[test]
fn unknown_kinds_are_preserved() {
    let msg = parse("msh/2/json/!1", r#"{"type":"traceroute","from":1,"payload":{}}"#).unwrap();
    assert_eq!(msg.kind(), MessageKind::Unknown);
    assert_eq!(
        msg.payload,
        MeshPayload::Unknown {
            kind: "traceroute".into()
        }
    );
}

#[test]
fn unrecognized_topics_are_rejected() {
    for topic in [
        "msh/2/e/LongFast/!698535e0",
        "msh/2/json",
        "telemetry/2/json/!1",
        "msh/2/json/",
    ] {
        let err = parse(topic, r#"{"type":"text","payload":{"text":"x"}}"#).unwrap_err();
        assert!(
            matches!(err, ParseError::UnrecognizedTopic { .. }),
            "{} gave {:?}",
            topic,
            err
        );
    }
}

#[test]
fn malformed_payloads_are_rejected() {
    let cases = [
        ("not json at all", "envelope"),
        ("[1,2,3]", "envelope"),
        (r#"{"type":"text","payload":{}}"#, "text"),
        (r#"{"type":"position","payload":{"latitude_i":1}}"#, "position"),
        (r#"{"type":"position","payload":{"latitude":95.0,"longitude":1.0}}"#, "position"),
        (r#"{"type":"telemetry","payload":"87%"}"#, "telemetry"),
        (r#"{"type":"nodeinfo","payload":{}}"#, "nodeinfo"),
    ];
    for (body, kind) in cases {
        match parse("msh/2/json/!1", body) {
            Err(ParseError::MalformedPayload { kind: k, .. }) => assert_eq!(k, kind, "{}", body),
            other => panic!("{} gave {:?}", body, other),
        }
    }
}

#[test]
fn missing_node_id_is_malformed() {
    let err = parse(
        "msh/2/json/LongFast",
        r#"{"type":"text","payload":{"text":"who am i"}}"#,
    )
    .unwrap_err();
    assert!(matches!(err, ParseError::MalformedPayload { .. }));
}
