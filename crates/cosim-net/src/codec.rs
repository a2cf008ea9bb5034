//! Tagged binary frame codec.
//!
//! Every message is serialized as a self-describing frame. The first two
//! header words are the message type and the payload shape; the shape decides
//! which length-prefixed sections follow:
//!
//! ```text
//! [type][shape]                                                   empty
//! [type][shape][n][n x f64]                                       numeric
//! [type][shape][n][n x byte]                                      text
//! [type][shape][nameLen][nameLen x byte][argLen][argLen x f64]    call
//! [type][shape][uLen][uLen x f64][yLen][yLen x f64]               dual
//! ```
//!
//! All header words are `i32` little-endian, all values `f64` little-endian.
//! Declared lengths must consume the buffer exactly: a frame that would read
//! past its end, or that leaves trailing bytes, is rejected as
//! [`MalformedFrame`].

/// Size of one header word in bytes.
const WORD_LEN: usize = 4;

/// Size of one encoded value in bytes.
const VALUE_LEN: usize = 8;

/// Smallest valid frame: the type and shape words.
pub const MIN_HEADER_LEN: usize = 2 * WORD_LEN;

/// Text token that asks the server to shut down, whatever the type tag.
pub const TERMINATE_TOKEN: &str = "terminate";

/// Text the server answers a shutdown request with.
pub const SHUTTING_DOWN: &str = "shutting down";

/// Prefix of a text reply carrying a server-side failure.
pub const ERROR_PREFIX: &str = "error: ";

// ---------------------------------------------------------------------------
// Type tags
// ---------------------------------------------------------------------------

/// Message type tag. The discriminant is the wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageType {
    /// Handshake, optionally carrying a bootstrap text for the remote process.
    Connect = 1,
    /// Ask the peer to acknowledge and leave its loop.
    Shutdown = 2,
    /// Per-step input values.
    InputData = 3,
    /// Model parameters pushed before initialization.
    ParameterData = 4,
    /// Reset the remote model state.
    Initialize = 5,
    /// Request the outputs for the current step.
    ComputeOutput = 6,
    /// Advance the remote model state by one step.
    UpdateState = 7,
    /// Final exchange of a run, answered with the last input/output snapshot.
    Terminate = 8,
    /// List the functions the remote side can call.
    FunctionQuery = 9,
    /// Invoke a named function with numeric arguments.
    FunctionCall = 10,
    /// Answer to a function query or call.
    FunctionReply = 11,
}

impl MessageType {
    /// Every message type, in wire order.
    pub const ALL: [MessageType; 11] = [
        MessageType::Connect,
        MessageType::Shutdown,
        MessageType::InputData,
        MessageType::ParameterData,
        MessageType::Initialize,
        MessageType::ComputeOutput,
        MessageType::UpdateState,
        MessageType::Terminate,
        MessageType::FunctionQuery,
        MessageType::FunctionCall,
        MessageType::FunctionReply,
    ];

    /// Wire value of this tag.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Look up a tag by its wire value.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    /// Tag the peer uses when answering a request of this type.
    ///
    /// Function queries and calls are answered with [`MessageType::FunctionReply`];
    /// every other request is answered under its own tag.
    pub fn reply_type(self) -> Self {
        match self {
            MessageType::FunctionQuery | MessageType::FunctionCall => MessageType::FunctionReply,
            other => other,
        }
    }
}

/// Payload shape discriminant, carried as the second header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Shape {
    /// No sections.
    Empty = 0,
    /// One `f64` array.
    Numeric = 1,
    /// One UTF-8 byte string.
    Text = 2,
    /// Function name followed by an `f64` argument array.
    Call = 3,
    /// Input array followed by output array.
    Dual = 4,
}

impl Shape {
    fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Shape::Empty),
            1 => Some(Shape::Numeric),
            2 => Some(Shape::Text),
            3 => Some(Shape::Call),
            4 => Some(Shape::Dual),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Message body. The variant is the shape written to the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// No data.
    Empty,
    /// Array of values.
    Numeric(Vec<f64>),
    /// UTF-8 string.
    Text(String),
    /// Named function call.
    Call {
        /// Function name.
        name: String,
        /// Numeric arguments.
        args: Vec<f64>,
    },
    /// Input/output snapshot.
    Dual {
        /// Input values.
        u: Vec<f64>,
        /// Output values.
        y: Vec<f64>,
    },
}

impl Payload {
    /// Shape discriminant of this payload.
    pub fn shape(&self) -> Shape {
        match self {
            Payload::Empty => Shape::Empty,
            Payload::Numeric(_) => Shape::Numeric,
            Payload::Text(_) => Shape::Text,
            Payload::Call { .. } => Shape::Call,
            Payload::Dual { .. } => Shape::Dual,
        }
    }
}

/// A type tag plus its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Type tag.
    pub kind: MessageType,
    /// Body.
    pub payload: Payload,
}

impl Message {
    /// Build a message from its parts.
    pub fn new(kind: MessageType, payload: Payload) -> Self {
        Self { kind, payload }
    }

    /// Message without a body.
    pub fn empty(kind: MessageType) -> Self {
        Self::new(kind, Payload::Empty)
    }

    /// Message carrying an array of values.
    pub fn numeric(kind: MessageType, values: impl Into<Vec<f64>>) -> Self {
        Self::new(kind, Payload::Numeric(values.into()))
    }

    /// Message carrying a string.
    pub fn text(kind: MessageType, text: impl Into<String>) -> Self {
        Self::new(kind, Payload::Text(text.into()))
    }

    /// Function call message.
    pub fn call(name: impl Into<String>, args: impl Into<Vec<f64>>) -> Self {
        Self::new(
            MessageType::FunctionCall,
            Payload::Call {
                name: name.into(),
                args: args.into(),
            },
        )
    }

    /// Input/output snapshot message.
    pub fn dual(kind: MessageType, u: impl Into<Vec<f64>>, y: impl Into<Vec<f64>>) -> Self {
        Self::new(
            kind,
            Payload::Dual {
                u: u.into(),
                y: y.into(),
            },
        )
    }

    /// Whether this message asks the receiver to shut down.
    ///
    /// True for the [`MessageType::Shutdown`] tag and for a text payload equal
    /// to [`TERMINATE_TOKEN`] under any tag.
    pub fn is_shutdown(&self) -> bool {
        self.kind == MessageType::Shutdown
            || matches!(&self.payload, Payload::Text(t) if t == TERMINATE_TOKEN)
    }

    /// Server-side failure text, if this is an error reply.
    pub fn remote_error(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(t) => t.strip_prefix(ERROR_PREFIX),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A frame that cannot be decoded. The frame is rejected as a whole.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedFrame {
    /// Fewer bytes than the two header words.
    #[error("frame of {len} bytes is shorter than the {MIN_HEADER_LEN}-byte header")]
    TooShort {
        /// Actual buffer length.
        len: usize,
    },

    /// The type word is not a known tag.
    #[error("unknown message type {0}")]
    UnknownType(i32),

    /// The shape word is not a known shape.
    #[error("unknown payload shape {0}")]
    UnknownShape(i32),

    /// A count field is negative.
    #[error("negative length {value} at offset {offset}")]
    NegativeLength {
        /// Offending value.
        value: i32,
        /// Byte offset of the count field.
        offset: usize,
    },

    /// A declared section runs past the end of the buffer.
    #[error("section at offset {offset} needs {needed} bytes, {available} remain")]
    Truncated {
        /// Byte offset where the section starts.
        offset: usize,
        /// Bytes the section declares.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// Bytes remain after the last declared section.
    #[error("{0} trailing bytes after the last section")]
    TrailingBytes(usize),

    /// A text section is not UTF-8.
    #[error("text section is not valid UTF-8")]
    InvalidUtf8,
}

/// A payload too large for the 32-bit length fields.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("section of {0} elements does not fit a 32-bit length field")]
pub struct LengthOverflow(pub usize);

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Serialize a message into a frame.
pub fn encode(message: &Message) -> Result<Vec<u8>, LengthOverflow> {
    let mut out = Vec::with_capacity(MIN_HEADER_LEN + body_len(&message.payload));
    put_word(&mut out, message.kind.code());
    put_word(&mut out, message.payload.shape() as i32);

    match &message.payload {
        Payload::Empty => {}
        Payload::Numeric(values) => put_values(&mut out, values)?,
        Payload::Text(text) => put_bytes(&mut out, text.as_bytes())?,
        Payload::Call { name, args } => {
            put_bytes(&mut out, name.as_bytes())?;
            put_values(&mut out, args)?;
        }
        Payload::Dual { u, y } => {
            put_values(&mut out, u)?;
            put_values(&mut out, y)?;
        }
    }

    Ok(out)
}

fn body_len(payload: &Payload) -> usize {
    let values = |v: &[f64]| WORD_LEN + v.len() * VALUE_LEN;
    match payload {
        Payload::Empty => 0,
        Payload::Numeric(v) => values(v),
        Payload::Text(t) => WORD_LEN + t.len(),
        Payload::Call { name, args } => WORD_LEN + name.len() + values(args),
        Payload::Dual { u, y } => values(u) + values(y),
    }
}

fn put_word(out: &mut Vec<u8>, word: i32) {
    out.extend_from_slice(&word.to_le_bytes());
}

fn put_count(out: &mut Vec<u8>, count: usize) -> Result<(), LengthOverflow> {
    let word = i32::try_from(count).map_err(|_| LengthOverflow(count))?;
    put_word(out, word);
    Ok(())
}

fn put_values(out: &mut Vec<u8>, values: &[f64]) -> Result<(), LengthOverflow> {
    put_count(out, values.len())?;
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    Ok(())
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), LengthOverflow> {
    put_count(out, bytes.len())?;
    out.extend_from_slice(bytes);
    Ok(())
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Deserialize a frame into a message.
///
/// Never reads outside `frame`; every length is checked before the section
/// it describes is touched.
pub fn decode(frame: &[u8]) -> Result<Message, MalformedFrame> {
    if frame.len() < MIN_HEADER_LEN {
        return Err(MalformedFrame::TooShort { len: frame.len() });
    }

    let mut reader = Reader::new(frame);
    let type_code = reader.word()?;
    let kind = MessageType::from_code(type_code).ok_or(MalformedFrame::UnknownType(type_code))?;
    let shape_code = reader.word()?;
    let shape = Shape::from_code(shape_code).ok_or(MalformedFrame::UnknownShape(shape_code))?;

    let payload = match shape {
        Shape::Empty => Payload::Empty,
        Shape::Numeric => Payload::Numeric(reader.values()?),
        Shape::Text => Payload::Text(reader.text()?),
        Shape::Call => {
            let name = reader.text()?;
            let args = reader.values()?;
            Payload::Call { name, args }
        }
        Shape::Dual => {
            let u = reader.values()?;
            let y = reader.values()?;
            Payload::Dual { u, y }
        }
    };

    reader.finish()?;
    Ok(Message::new(kind, payload))
}

/// Bounds-checked cursor over a frame.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], MalformedFrame> {
        let available = self.buf.len() - self.pos;
        let truncated = MalformedFrame::Truncated {
            offset: self.pos,
            needed,
            available,
        };
        let end = self.pos.checked_add(needed).ok_or(truncated.clone())?;
        let section = self.buf.get(self.pos..end).ok_or(truncated)?;
        self.pos = end;
        Ok(section)
    }

    fn word(&mut self) -> Result<i32, MalformedFrame> {
        let bytes = self.take(WORD_LEN)?;
        let mut word = [0u8; WORD_LEN];
        word.copy_from_slice(bytes);
        Ok(i32::from_le_bytes(word))
    }

    fn count(&mut self) -> Result<usize, MalformedFrame> {
        let offset = self.pos;
        let value = self.word()?;
        usize::try_from(value).map_err(|_| MalformedFrame::NegativeLength { value, offset })
    }

    fn values(&mut self) -> Result<Vec<f64>, MalformedFrame> {
        let offset = self.pos;
        let count = self.count()?;
        let needed = count
            .checked_mul(VALUE_LEN)
            .ok_or(MalformedFrame::Truncated {
                offset,
                needed: usize::MAX,
                available: self.buf.len() - self.pos,
            })?;
        let bytes = self.take(needed)?;
        Ok(bytes
            .chunks_exact(VALUE_LEN)
            .map(|chunk| {
                let mut value = [0u8; VALUE_LEN];
                value.copy_from_slice(chunk);
                f64::from_le_bytes(value)
            })
            .collect())
    }

    fn text(&mut self) -> Result<String, MalformedFrame> {
        let len = self.count()?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| MalformedFrame::InvalidUtf8)
    }

    fn finish(self) -> Result<(), MalformedFrame> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            extra => Err(MalformedFrame::TrailingBytes(extra)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn sample_payloads() -> Vec<Payload> {
        vec![
            Payload::Empty,
            Payload::Numeric(vec![]),
            Payload::Numeric(vec![0.0, 4.32, 0.99, 1.0]),
            Payload::Text(String::new()),
            Payload::Text("terminate".to_string()),
            Payload::Text("gruß 🚀".to_string()),
            Payload::Call {
                name: "ewma".to_string(),
                args: vec![0.0, 4.32, 0.99, 1.0],
            },
            Payload::Call {
                name: String::new(),
                args: vec![],
            },
            Payload::Dual {
                u: vec![1.5],
                y: vec![f64::MIN, f64::MAX, -0.0],
            },
            Payload::Dual {
                u: vec![],
                y: vec![],
            },
        ]
    }

    fn random_message(rng: &mut StdRng) -> Message {
        let kind = MessageType::ALL[rng.random_range(0..MessageType::ALL.len())];
        let mut values = |rng: &mut StdRng| -> Vec<f64> {
            let n = rng.random_range(0..8);
            (0..n).map(|_| rng.random_range(-1.0e6..1.0e6)).collect()
        };
        let payload = match rng.random_range(0..5) {
            0 => Payload::Empty,
            1 => Payload::Numeric(values(rng)),
            2 => Payload::Text("x".repeat(rng.random_range(0..16))),
            3 => Payload::Call {
                name: "f".repeat(rng.random_range(0..8)),
                args: values(rng),
            },
            _ => Payload::Dual {
                u: values(rng),
                y: values(rng),
            },
        };
        Message::new(kind, payload)
    }

    #[test]
    fn test_every_type_and_shape_roundtrips() {
        for kind in MessageType::ALL {
            for payload in sample_payloads() {
                let msg = Message::new(kind, payload);
                let bytes = encode(&msg).unwrap();
                let decoded = decode(&bytes).unwrap();
                assert_eq!(decoded, msg);
            }
        }
    }

    #[test]
    fn test_numeric_layout_is_little_endian_words_then_values() {
        let msg = Message::numeric(MessageType::InputData, vec![2.5]);
        let bytes = encode(&msg).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&3i32.to_le_bytes());
        expected.extend_from_slice(&1i32.to_le_bytes());
        expected.extend_from_slice(&1i32.to_le_bytes());
        expected.extend_from_slice(&2.5f64.to_le_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_call_layout_has_name_then_args() {
        let bytes = encode(&Message::call("ab", vec![1.0, 2.0])).unwrap();
        assert_eq!(bytes.len(), 8 + 4 + 2 + 4 + 16);
        assert_eq!(&bytes[8..12], &2i32.to_le_bytes());
        assert_eq!(&bytes[12..14], b"ab");
        assert_eq!(&bytes[14..18], &2i32.to_le_bytes());
    }

    #[test]
    fn test_empty_payload_is_header_only() {
        let bytes = encode(&Message::empty(MessageType::Initialize)).unwrap();
        assert_eq!(bytes.len(), MIN_HEADER_LEN);
    }

    #[test]
    fn test_short_buffer_rejected() {
        for len in 0..MIN_HEADER_LEN {
            let result = decode(&vec![0u8; len]);
            assert_eq!(result, Err(MalformedFrame::TooShort { len }));
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut bytes = encode(&Message::empty(MessageType::Connect)).unwrap();
        bytes[0..4].copy_from_slice(&99i32.to_le_bytes());
        assert_eq!(decode(&bytes), Err(MalformedFrame::UnknownType(99)));
    }

    #[test]
    fn test_unknown_shape_rejected() {
        let mut bytes = encode(&Message::empty(MessageType::Connect)).unwrap();
        bytes[4..8].copy_from_slice(&7i32.to_le_bytes());
        assert_eq!(decode(&bytes), Err(MalformedFrame::UnknownShape(7)));
    }

    #[test]
    fn test_negative_count_rejected() {
        // The old dialect marked strings with a negative count; that is malformed now.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MessageType::InputData.code().to_le_bytes());
        bytes.extend_from_slice(&(Shape::Text as i32).to_le_bytes());
        bytes.extend_from_slice(&(-9i32).to_le_bytes());
        bytes.extend_from_slice(b"terminate");
        assert_eq!(
            decode(&bytes),
            Err(MalformedFrame::NegativeLength {
                value: -9,
                offset: 8
            })
        );
    }

    #[test]
    fn test_oversized_count_does_not_read_past_buffer() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MessageType::InputData.code().to_le_bytes());
        bytes.extend_from_slice(&(Shape::Numeric as i32).to_le_bytes());
        bytes.extend_from_slice(&i32::MAX.to_le_bytes());
        bytes.extend_from_slice(&1.0f64.to_le_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(MalformedFrame::Truncated { offset: 12, .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode(&Message::numeric(MessageType::InputData, vec![1.0])).unwrap();
        bytes.push(0);
        assert_eq!(decode(&bytes), Err(MalformedFrame::TrailingBytes(1)));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut bytes = encode(&Message::text(MessageType::Connect, "ab")).unwrap();
        let last = bytes.len() - 1;
        bytes[last] = 0xFF;
        assert_eq!(decode(&bytes), Err(MalformedFrame::InvalidUtf8));
    }

    #[test]
    fn test_every_truncation_is_rejected() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..200 {
            let bytes = encode(&random_message(&mut rng)).unwrap();
            for cut in 0..bytes.len() {
                assert!(
                    decode(&bytes[..cut]).is_err(),
                    "prefix of {cut}/{} bytes decoded",
                    bytes.len()
                );
            }
        }
    }

    #[test]
    fn test_corrupted_frames_never_panic_and_stay_canonical() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..2000 {
            let mut bytes = encode(&random_message(&mut rng)).unwrap();
            let flips = rng.random_range(1..4);
            for _ in 0..flips {
                let at = rng.random_range(0..bytes.len());
                bytes[at] = rng.random();
            }
            // A corrupted frame that still decodes must re-encode to the same bytes.
            if let Ok(msg) = decode(&bytes) {
                assert_eq!(encode(&msg).unwrap(), bytes);
            }
        }
    }

    #[test]
    fn test_reply_type_mapping() {
        assert_eq!(
            MessageType::FunctionCall.reply_type(),
            MessageType::FunctionReply
        );
        assert_eq!(
            MessageType::FunctionQuery.reply_type(),
            MessageType::FunctionReply
        );
        assert_eq!(
            MessageType::ComputeOutput.reply_type(),
            MessageType::ComputeOutput
        );
    }

    #[test]
    fn test_type_codes_match_streaming_dialect() {
        assert_eq!(MessageType::Connect.code(), 1);
        assert_eq!(MessageType::Shutdown.code(), 2);
        assert_eq!(MessageType::InputData.code(), 3);
        assert_eq!(MessageType::from_code(0), None);
    }

    #[test]
    fn test_shutdown_detection() {
        assert!(Message::empty(MessageType::Shutdown).is_shutdown());
        assert!(Message::text(MessageType::InputData, TERMINATE_TOKEN).is_shutdown());
        assert!(!Message::text(MessageType::Connect, "model").is_shutdown());
    }

    #[test]
    fn test_remote_error_prefix() {
        let reply = Message::text(MessageType::ComputeOutput, "error: not initialized");
        assert_eq!(reply.remote_error(), Some("not initialized"));
        assert_eq!(Message::text(MessageType::Connect, "ok").remote_error(), None);
    }
}
