//! Handshake message codec shared by the built-in handlers.
//!
//! A message is a big-endian `u16` body length followed by a JSON body
//! tagged with the message `type`. Byte fields travel as hex strings.
//! Messages may span several blobs: [`MessageBuffer`] reassembles inbound
//! bytes and [`Outbox`] chunks outbound bytes to whatever blob capacity the
//! driver offers.

use serde::{Deserialize, Serialize};

use super::blob::Blob;
use super::error::AuthError;

const HEADER_LEN: usize = 2;

/// Upper bound on a message body.
pub(crate) const MAX_BODY_LEN: usize = 2048;

/// Largest encoded message, header included.
pub(crate) const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_BODY_LEN;

/// One handshake message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum Message {
    /// Client opens a shared-key exchange.
    Hello {
        protocol: String,
        user: String,
        #[serde(with = "hex_bytes")]
        nonce: Vec<u8>,
    },
    /// Server answers with its nonce and, for mutual variants, its proof.
    Challenge {
        server: String,
        #[serde(with = "hex_bytes")]
        nonce: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none", with = "hex_bytes_opt")]
        proof: Option<Vec<u8>>,
    },
    /// Client proves knowledge of the shared key.
    Proof {
        #[serde(with = "hex_bytes")]
        proof: Vec<u8>,
    },
    /// Final accept/reject, with a reason on reject.
    Verdict {
        accepted: bool,
        #[serde(default)]
        reason: String,
    },
    /// Server lists the protocols it will run inside the envelope.
    Offer { protocols: Vec<String> },
    /// Client picks one offered protocol.
    Choice { protocol: String },
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

mod hex_bytes_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| hex::decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

impl Message {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::Challenge { .. } => "challenge",
            Message::Proof { .. } => "proof",
            Message::Verdict { .. } => "verdict",
            Message::Offer { .. } => "offer",
            Message::Choice { .. } => "choice",
        }
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, AuthError> {
        let body = serde_json::to_vec(self)
            .map_err(|e| AuthError::malformed(format!("cannot encode {}: {}", self.name(), e)))?;
        if body.len() > MAX_BODY_LEN {
            return Err(AuthError::malformed(format!(
                "{} body of {} bytes exceeds {}",
                self.name(),
                body.len(),
                MAX_BODY_LEN
            )));
        }

        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decode(body: &[u8]) -> Result<Self, AuthError> {
        serde_json::from_slice(body)
            .map_err(|e| AuthError::malformed(format!("invalid message: {}", e)))
    }
}

/// Reassembles messages from blobs of arbitrary size.
#[derive(Debug, Default)]
pub(crate) struct MessageBuffer {
    buf: Vec<u8>,
}

impl MessageBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Move every unread byte of `blob` into the buffer.
    pub(crate) fn absorb(&mut self, blob: &mut Blob) {
        self.buf.extend_from_slice(blob.take_unread());
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pop the next complete message, or `None` if more bytes are needed.
    pub(crate) fn next_message(&mut self) -> Result<Option<Message>, AuthError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if len > MAX_BODY_LEN {
            return Err(AuthError::malformed(format!(
                "declared body of {} bytes exceeds {}",
                len, MAX_BODY_LEN
            )));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let message = Message::decode(&self.buf[HEADER_LEN..HEADER_LEN + len])?;
        self.buf.drain(..HEADER_LEN + len);
        Ok(Some(message))
    }
}

/// Outbound bytes waiting to be written into blobs.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    pending: Vec<u8>,
    sent: usize,
}

impl Outbox {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn queue(&mut self, message: &Message) -> Result<(), AuthError> {
        let encoded = message.encode()?;
        self.pending.extend_from_slice(&encoded);
        Ok(())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.sent == self.pending.len()
    }

    /// Write as much as fits into `blob`. Returns `true` once drained.
    pub(crate) fn fill(&mut self, blob: &mut Blob) -> bool {
        let n = blob.write(&self.pending[self.sent..]);
        self.sent += n;
        if self.is_empty() {
            self.pending.clear();
            self.sent = 0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(buffer: &mut MessageBuffer, bytes: &[u8]) {
        let mut blob = Blob::with_capacity(bytes.len());
        blob.write(bytes);
        buffer.absorb(&mut blob);
    }

    #[test]
    fn test_hello_survives_encoding() {
        let hello = Message::Hello {
            protocol: "p9sk1".into(),
            user: "alice".into(),
            nonce: vec![1, 2, 3, 4],
        };
        let mut buffer = MessageBuffer::new();
        feed(&mut buffer, &hello.encode().unwrap());
        assert_eq!(buffer.next_message().unwrap(), Some(hello));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_challenge_without_proof() {
        let challenge = Message::Challenge {
            server: "fs".into(),
            nonce: vec![9; 8],
            proof: None,
        };
        let mut buffer = MessageBuffer::new();
        feed(&mut buffer, &challenge.encode().unwrap());
        assert_eq!(buffer.next_message().unwrap(), Some(challenge));
    }

    #[test]
    fn test_partial_message_needs_more_bytes() {
        let offer = Message::Offer {
            protocols: vec!["p9sk1".into(), "p9sk2".into()],
        };
        let bytes = offer.encode().unwrap();
        let mut buffer = MessageBuffer::new();

        feed(&mut buffer, &bytes[..2]);
        assert_eq!(buffer.next_message().unwrap(), None);
        feed(&mut buffer, &bytes[2..7]);
        assert_eq!(buffer.next_message().unwrap(), None);
        feed(&mut buffer, &bytes[7..]);
        assert_eq!(buffer.next_message().unwrap(), Some(offer));
    }

    #[test]
    fn test_two_messages_in_one_blob() {
        let a = Message::Choice {
            protocol: "p9sk2".into(),
        };
        let b = Message::Verdict {
            accepted: false,
            reason: "no".into(),
        };
        let mut bytes = a.encode().unwrap();
        bytes.extend(b.encode().unwrap());

        let mut buffer = MessageBuffer::new();
        feed(&mut buffer, &bytes);
        assert_eq!(buffer.next_message().unwrap(), Some(a));
        assert_eq!(buffer.next_message().unwrap(), Some(b));
        assert_eq!(buffer.next_message().unwrap(), None);
    }

    fn framed(body: &[u8]) -> Vec<u8> {
        let mut bytes = (body.len() as u16).to_be_bytes().to_vec();
        bytes.extend_from_slice(body);
        bytes
    }

    #[test]
    fn test_body_is_tagged_json() {
        let choice = Message::Choice {
            protocol: "p9sk2".into(),
        };
        let encoded = choice.encode().unwrap();
        let body: serde_json::Value = serde_json::from_slice(&encoded[HEADER_LEN..]).unwrap();
        assert_eq!(body["type"], "choice");
        assert_eq!(body["protocol"], "p9sk2");
    }

    #[test]
    fn test_byte_fields_travel_as_hex() {
        let proof = Message::Proof {
            proof: vec![0xde, 0xad],
        };
        let encoded = proof.encode().unwrap();
        let body: serde_json::Value = serde_json::from_slice(&encoded[HEADER_LEN..]).unwrap();
        assert_eq!(body["proof"], "dead");
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let mut buffer = MessageBuffer::new();
        feed(&mut buffer, &framed(br#"{"type":"ticket"}"#));
        assert!(matches!(
            buffer.next_message(),
            Err(AuthError::Malformed { .. })
        ));
    }

    #[test]
    fn test_oversize_declared_length_is_malformed() {
        let mut buffer = MessageBuffer::new();
        feed(&mut buffer, &[0xff, 0xff]);
        assert!(buffer.next_message().is_err());
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let mut buffer = MessageBuffer::new();
        feed(&mut buffer, &framed(br#"{"type":"hello","protocol":"p9sk1"}"#));
        assert!(buffer.next_message().is_err());
    }

    #[test]
    fn test_non_boolean_verdict_is_malformed() {
        let mut buffer = MessageBuffer::new();
        feed(&mut buffer, &framed(br#"{"type":"verdict","accepted":7}"#));
        assert!(buffer.next_message().is_err());
    }

    #[test]
    fn test_bad_hex_is_malformed() {
        let mut buffer = MessageBuffer::new();
        feed(&mut buffer, &framed(br#"{"type":"proof","proof":"zz"}"#));
        assert!(buffer.next_message().is_err());
    }

    #[test]
    fn test_non_json_body_is_malformed() {
        let mut buffer = MessageBuffer::new();
        feed(&mut buffer, &framed(&[0xff, 0xfe]));
        assert!(buffer.next_message().is_err());
    }

    #[test]
    fn test_outbox_chunks_across_small_blobs() {
        let proof = Message::Proof {
            proof: vec![0xab; 40],
        };
        let encoded = proof.encode().unwrap();
        let mut outbox = Outbox::new();
        outbox.queue(&proof).unwrap();

        let mut collected = Vec::new();
        let mut blob = Blob::with_capacity(16);
        loop {
            blob.clear();
            let drained = outbox.fill(&mut blob);
            collected.extend_from_slice(blob.as_slice());
            if drained {
                break;
            }
        }
        assert_eq!(collected, encoded);
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_oversize_body_is_rejected_on_encode() {
        let proof = Message::Proof {
            proof: vec![0; MAX_BODY_LEN + 1],
        };
        assert!(proof.encode().is_err());
    }
}
