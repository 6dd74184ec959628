use anyhow::Result;
use bytes::BytesMut;
use sipturn_codec::{
    DecodeResult, Decoder,
    channel_data::ChannelData,
    crypto::IntegrityKey,
    message::{
        MessageEncoder,
        attributes::{error::ErrorType, *},
        methods::*,
    },
};

const TOKEN: [u8; 12] = [
    0x45, 0x58, 0x65, 0x61, 0x57, 0x53, 0x5a, 0x6e, 0x57, 0x35, 0x76, 0x46,
];

fn key() -> IntegrityKey {
    IntegrityKey::long_term("user1", "test", "localhost")
}

#[test]
#[rustfmt::skip]
fn authenticated_allocate_exchange() -> Result<()> {
    let mut decoder = Decoder::default();
    let mut bytes = BytesMut::with_capacity(1500);

    {
        let mut message = MessageEncoder::new(ALLOCATE_REQUEST, &TOKEN, &mut bytes);
        message.append::<RequestedTransport>(RequestedTransport::Udp);
        message.append::<Lifetime>(600);
        message.append::<UserName>("user1");
        message.append::<Realm>("localhost");
        message.append::<Nonce>("UHm1hiE0jm9r9rGS");
        message.flush(Some(&key()))?;
    }

    {
        let DecodeResult::Message(message) = decoder.decode(&bytes)? else {
            return Err(anyhow::anyhow!("Expected Message"));
        };

        assert_eq!(message.method(), ALLOCATE_REQUEST);
        assert_eq!(message.transaction_id(), TOKEN);
        assert_eq!(message.get::<RequestedTransport>(), Some(RequestedTransport::Udp));
        assert_eq!(message.get::<Lifetime>(), Some(600));
        assert_eq!(message.get::<UserName>(), Some("user1"));
        assert_eq!(message.get::<Nonce>(), Some("UHm1hiE0jm9r9rGS"));
        assert!(message.has_integrity());
        assert!(message.get::<Fingerprint>().is_some());

        message.checksum(&key())?;
        assert!(message.checksum(&IntegrityKey::long_term("user1", "nope", "localhost")).is_err());
    }

    {
        let mut message = MessageEncoder::new(ALLOCATE_RESPONSE, &TOKEN, &mut bytes);
        message.append::<XorRelayedAddress>("127.0.0.1:55616".parse()?);
        message.append::<XorMappedAddress>("[2001:db8::1]:51678".parse()?);
        message.append::<Lifetime>(600);
        message.append::<ReservationToken>(0x0102030405060708);
        message.flush(Some(&key()))?;
    }

    {
        let DecodeResult::Message(message) = decoder.decode(&bytes)? else {
            return Err(anyhow::anyhow!("Expected Message"));
        };

        assert_eq!(message.method(), ALLOCATE_RESPONSE);
        assert_eq!(message.get::<XorRelayedAddress>(), Some("127.0.0.1:55616".parse()?));
        assert_eq!(message.get::<XorMappedAddress>(), Some("[2001:db8::1]:51678".parse()?));
        assert_eq!(message.get::<ReservationToken>(), Some(0x0102030405060708));

        message.checksum(&key())?;
    }

    Ok(())
}

#[test]
fn unauthorized_error_response() -> Result<()> {
    let mut decoder = Decoder::default();
    let mut bytes = BytesMut::with_capacity(1500);

    {
        let mut message = MessageEncoder::new(ALLOCATE_ERROR, &TOKEN, &mut bytes);
        message.append::<ErrorCode>(ErrorCode::from(ErrorType::Unauthorized));
        message.append::<Realm>("localhost");
        message.append::<Nonce>("UHm1hiE0jm9r9rGS");
        message.flush(None)?;
    }

    let DecodeResult::Message(message) = decoder.decode(&bytes)? else {
        return Err(anyhow::anyhow!("Expected Message"));
    };

    assert!(message.method().is_error());
    assert!(!message.has_integrity());
    assert_eq!(
        message.get::<ErrorCode>().map(|it| it.status()),
        Some(401)
    );
    assert_eq!(message.get::<Realm>(), Some("localhost"));
    Ok(())
}

#[test]
fn channel_bind_and_indications() -> Result<()> {
    let mut decoder = Decoder::default();
    let mut bytes = BytesMut::with_capacity(1500);
    let peer = "10.0.0.7:4000".parse()?;

    {
        let mut message = MessageEncoder::new(CHANNEL_BIND_REQUEST, &TOKEN, &mut bytes);
        message.append::<ChannelNumber>(0x4000);
        message.append::<XorPeerAddress>(peer);
        message.flush(None)?;
    }

    {
        let DecodeResult::Message(message) = decoder.decode(&bytes)? else {
            return Err(anyhow::anyhow!("Expected Message"));
        };

        assert_eq!(message.method(), CHANNEL_BIND_REQUEST);
        assert_eq!(message.get::<ChannelNumber>(), Some(0x4000));
        assert_eq!(message.get::<XorPeerAddress>(), Some(peer));
    }

    {
        let mut message = MessageEncoder::new(DATA_INDICATION, &TOKEN, &mut bytes);
        message.append::<XorPeerAddress>(peer);
        message.append::<Data>(&[7u8; 101]);
        message.flush(None)?;
    }

    {
        assert_eq!(Decoder::message_size(&bytes, false)?, bytes.len());

        let DecodeResult::Message(message) = decoder.decode(&bytes)? else {
            return Err(anyhow::anyhow!("Expected Message"));
        };

        assert_eq!(message.method(), DATA_INDICATION);
        assert_eq!(message.get::<Data>().map(|it| it.len()), Some(101));
    }

    {
        ChannelData {
            number: 0x4000,
            bytes: b"hello",
        }
        .encode(&mut bytes, true);

        assert_eq!(bytes.len(), 12);
        assert_eq!(Decoder::message_size(&bytes, true)?, 12);

        let DecodeResult::ChannelData(data) = decoder.decode(&bytes)? else {
            return Err(anyhow::anyhow!("Expected ChannelData"));
        };

        assert_eq!(data.number(), 0x4000);
        assert_eq!(data.as_bytes(), b"hello");
    }

    Ok(())
}

#[test]
fn unknown_required_attributes_are_reported() -> Result<()> {
    let mut decoder = Decoder::default();

    // Binding request with 0x0031 (required) and 0xC001 (optional), both unknown.
    #[rustfmt::skip]
    let bytes = [
        0x00u8, 0x01, 0x00, 0x10, 0x21, 0x12, 0xa4, 0x42,
        0x45, 0x58, 0x65, 0x61, 0x57, 0x53, 0x5a, 0x6e, 0x57, 0x35, 0x76, 0x46,
        0x00, 0x31, 0x00, 0x04, 0x01, 0x02, 0x03, 0x04,
        0xc0, 0x01, 0x00, 0x04, 0x01, 0x02, 0x03, 0x04,
    ];

    let DecodeResult::Message(message) = decoder.decode(&bytes)? else {
        return Err(anyhow::anyhow!("Expected Message"));
    };

    assert_eq!(message.method(), BINDING_REQUEST);
    assert_eq!(message.unknown_required(), &[0x0031]);

    let mut response = BytesMut::new();
    {
        let mut encoder = MessageEncoder::extend(BINDING_ERROR, &message, &mut response);
        encoder.append::<ErrorCode>(ErrorCode::from(ErrorType::UnknownAttribute));
        encoder.append::<UnknownAttributes>(message.unknown_required().to_vec());
        encoder.flush(None)?;
    }

    let DecodeResult::Message(message) = decoder.decode(&response)? else {
        return Err(anyhow::anyhow!("Expected Message"));
    };

    assert_eq!(message.transaction_id(), TOKEN);
    assert_eq!(message.get::<UnknownAttributes>(), Some(vec![0x0031]));
    Ok(())
}

#[test]
fn truncated_input_is_rejected() {
    let mut decoder = Decoder::default();

    assert!(decoder.decode(&[0x00, 0x01, 0x00]).is_err());
    assert!(decoder.decode(&[0x00, 0x01, 0x00, 0x08, 0x21, 0x12, 0xa4, 0x42]).is_err());
    assert!(decoder.decode(&[0x40, 0x00, 0x00, 0x08, 0x01]).is_err());
}
