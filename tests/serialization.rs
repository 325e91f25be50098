//! Wire format of primitives and the built-in session messages
#![allow(clippy::unwrap_used, clippy::expect_used)]

use hybrid_net::core::serialization::{DataBuilder, DataReader, EnumWidth, WireEnum};
use hybrid_net::error::ProtocolError;
use hybrid_net::protocol::message::{
    AcknowledgeRequest, AcknowledgeResponse, ClientSecretMessage, ClientSystemKind,
    ClientSystemMessage, ClientUdpPortMessage, DisconnectMessage, ServerSystemKind,
    ServerSystemMessage, ServerUdpPortMessage, WireFormat,
};

fn encode<T: WireFormat>(value: &T) -> Vec<u8> {
    let mut builder = DataBuilder::new();
    value.write(&mut builder);
    builder.freeze().to_vec()
}

fn decode<T: WireFormat>(bytes: &[u8]) -> T {
    let mut reader = DataReader::new(bytes);
    let value = T::read(&mut reader).unwrap();
    assert!(reader.is_empty(), "trailing bytes after decode");
    value
}

#[test]
fn test_primitive_layout_is_little_endian() {
    let mut builder = DataBuilder::new();
    builder
        .u8(0xAB)
        .bool(true)
        .i16(-2)
        .u32(0x0102_0304)
        .i64(-1)
        .f32(1.0)
        .string("Hi");
    let bytes = builder.freeze();

    let mut expected = vec![0xAB, 0x01, 0xFE, 0xFF, 0x04, 0x03, 0x02, 0x01];
    expected.extend_from_slice(&[0xFF; 8]);
    expected.extend_from_slice(&1.0f32.to_le_bytes());
    expected.extend_from_slice(&[0x02, 0x00, 0x00, 0x00, b'H', 0x00, b'i', 0x00]);
    assert_eq!(&bytes[..], &expected[..]);

    let mut reader = DataReader::new(&bytes);
    assert_eq!(reader.u8().unwrap(), 0xAB);
    assert!(reader.bool().unwrap());
    assert_eq!(reader.i16().unwrap(), -2);
    assert_eq!(reader.u32().unwrap(), 0x0102_0304);
    assert_eq!(reader.i64().unwrap(), -1);
    assert_eq!(reader.f32().unwrap(), 1.0);
    assert_eq!(reader.string().unwrap(), "Hi");
    assert!(reader.is_empty());
}

#[test]
fn test_strings_are_utf16_code_units() {
    let mut builder = DataBuilder::new();
    builder.string("").string("héllo").string("🦀");
    let bytes = builder.freeze();

    // Empty string is a bare zero count
    assert_eq!(&bytes[..4], &[0, 0, 0, 0]);
    // The crab needs a surrogate pair, so its count is 2
    let crab_at = bytes.len() - 8;
    assert_eq!(&bytes[crab_at..crab_at + 4], &[2, 0, 0, 0]);

    let mut reader = DataReader::new(&bytes);
    assert_eq!(reader.string().unwrap(), "");
    assert_eq!(reader.string().unwrap(), "héllo");
    assert_eq!(reader.string().unwrap(), "🦀");
}

#[test]
fn test_char_outside_bmp_becomes_replacement() {
    let mut builder = DataBuilder::new();
    builder.char('A').char('é').char('🦀');
    let bytes = builder.freeze();
    assert_eq!(bytes.len(), 6);

    let mut reader = DataReader::new(&bytes);
    assert_eq!(reader.char().unwrap(), 'A');
    assert_eq!(reader.char().unwrap(), 'é');
    assert_eq!(reader.char().unwrap(), '\u{FFFD}');
}

#[test]
fn test_reads_past_end_report_shortfall() {
    let mut reader = DataReader::new(&[1, 2, 3]);
    assert!(matches!(
        reader.u32(),
        Err(ProtocolError::UnexpectedEof {
            needed: 4,
            remaining: 3
        })
    ));
    // A failed read consumes nothing
    assert_eq!(reader.remaining(), 3);

    let mut reader = DataReader::new(&[0x05, 0, 0, 0, b'a', 0]);
    assert!(reader.string().is_err());

    let bytes = (-1i32).to_le_bytes();
    let mut reader = DataReader::new(&bytes);
    assert!(matches!(reader.string(), Err(ProtocolError::InvalidData(_))));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Busy,
}

impl WireEnum for Mode {
    const WIDTH: EnumWidth = EnumWidth::U8;

    fn discriminant(self) -> i64 {
        match self {
            Mode::Idle => 0,
            Mode::Busy => 7,
        }
    }

    fn from_discriminant(value: i64) -> Option<Self> {
        match value {
            0 => Some(Mode::Idle),
            7 => Some(Mode::Busy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wide {
    Far,
}

impl WireEnum for Wide {
    fn discriminant(self) -> i64 {
        100_000
    }

    fn from_discriminant(value: i64) -> Option<Self> {
        (value == 100_000).then_some(Wide::Far)
    }
}

#[test]
fn test_enum_width_controls_encoding() {
    let mut builder = DataBuilder::new();
    builder.enumeration(Mode::Busy).enumeration(Wide::Far);
    let bytes = builder.freeze();
    assert_eq!(bytes.len(), 1 + 4);
    assert_eq!(bytes[0], 7);
    assert_eq!(&bytes[1..], &100_000i32.to_le_bytes());

    let mut reader = DataReader::new(&bytes);
    assert_eq!(reader.enumeration::<Mode>().unwrap(), Mode::Busy);
    assert_eq!(reader.enumeration::<Wide>().unwrap(), Wide::Far);

    let mut reader = DataReader::new(&[3]);
    assert!(matches!(
        reader.enumeration::<Mode>(),
        Err(ProtocolError::InvalidData(_))
    ));
}

#[test]
fn test_session_messages_round_trip() {
    let secret = ClientSecretMessage {
        secret: "Ab3dE5gH1jK".to_string(),
    };
    assert_eq!(decode::<ClientSecretMessage>(&encode(&secret)), secret);

    let empty = ClientSecretMessage {
        secret: String::new(),
    };
    assert_eq!(encode(&empty), vec![0, 0, 0, 0]);
    assert_eq!(decode::<ClientSecretMessage>(&encode(&empty)), empty);

    let server_port = ServerUdpPortMessage {
        secret: "s".to_string(),
        port: 25000,
    };
    assert_eq!(encode(&server_port), vec![1, 0, 0, 0, b's', 0, 0xA8, 0x61]);
    assert_eq!(decode::<ServerUdpPortMessage>(&encode(&server_port)), server_port);

    let client_port = ClientUdpPortMessage {
        secret: "s".to_string(),
        port: 25001,
    };
    assert_eq!(
        encode(&client_port),
        vec![1, 0, 0, 0, b's', 0, 0xA9, 0x61]
    );
    assert_eq!(decode::<ClientUdpPortMessage>(&encode(&client_port)), client_port);

    let heartbeat = ClientSystemMessage::heartbeat("s");
    let decoded = decode::<ClientSystemMessage>(&encode(&heartbeat));
    assert_eq!(decoded.kind, ClientSystemKind::Heartbeat);
    assert_eq!(decoded.secret, "s");

    let established = ServerSystemMessage::connection_established();
    assert_eq!(
        decode::<ServerSystemMessage>(&encode(&established)).kind,
        ServerSystemKind::ConnectionEstablished
    );

    let response = AcknowledgeResponse::new("tok");
    assert_eq!(decode::<AcknowledgeResponse>(&encode(&response)), response);
}

#[test]
fn test_disconnect_carries_only_the_token() {
    let ack = AcknowledgeRequest::new("T0K3N")
        .with_timeout(std::time::Duration::from_millis(5))
        .with_max_retries(1);
    let message = DisconnectMessage::new("secret", ack);
    let decoded = decode::<DisconnectMessage>(&encode(&message));

    assert_eq!(decoded.secret, "secret");
    assert_eq!(decoded.ack.ack_token, "T0K3N");
    // Timeout and retry bound are local; the receiver sees defaults
    assert_eq!(decoded.ack, AcknowledgeRequest::new("T0K3N"));
}
