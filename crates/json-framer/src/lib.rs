//! Incremental JSON packet framer (component C1).
//!
//! Turns an arbitrary byte stream into a sequence of complete, well-formed
//! JSON object/array packets. Chunk boundaries are irrelevant: a packet may
//! be split across any number of `feed` calls and will still be delivered
//! whole. The framer validates only bracket/string/escape structure; full
//! JSON semantic validation is left to the consumer.

#[macro_use]
extern crate tracing;

use thiserror::Error;

/// The framer's single error kind. There is no recovery except [`JsonFramer::reset`].
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
#[error("invalid JSON packet data")]
pub struct ParseError;

impl ParseError {
    /// Wire error code, matching the `INVALID_DATA` entry of the bridge's error taxonomy.
    pub const CODE: u8 = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opener {
    Brace,
    Bracket,
}

/// Incremental JSON packet framer.
///
/// Not `Send`/`Sync` by itself since the packet handler is a boxed closure;
/// wrap in an owning task if cross-thread use is needed.
pub struct JsonFramer {
    buf: Vec<u8>,
    stack: Vec<Opener>,
    in_string: bool,
    escape_next: bool,
    packet_start: Option<usize>,
    max_packet_size: Option<usize>,
    handler: Option<Box<dyn FnMut(&[u8]) + Send>>,
}

impl Default for JsonFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonFramer {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            stack: Vec::new(),
            in_string: false,
            escape_next: false,
            packet_start: None,
            max_packet_size: None,
            handler: None,
        }
    }

    /// Installs the callback invoked once per complete packet.
    pub fn set_packet_handler<F>(&mut self, cb: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.handler = Some(Box::new(cb));
    }

    /// Optional guard on the in-flight packet size. Default unlimited.
    pub fn set_max_packet_size(&mut self, n: usize) {
        self.max_packet_size = Some(n);
    }

    /// Clears the internal buffer and state, e.g. after a parse error.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.stack.clear();
        self.in_string = false;
        self.escape_next = false;
        self.packet_start = None;
    }

    /// Appends bytes and advances the state machine, invoking the packet
    /// handler once per completed packet boundary found in this call (or
    /// spanning prior calls).
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), ParseError> {
        for &b in bytes {
            self.feed_byte(b)?;
        }
        Ok(())
    }

    fn feed_byte(&mut self, b: u8) -> Result<(), ParseError> {
        let pos = self.buf.len();
        self.buf.push(b);

        if self.in_string {
            if self.escape_next {
                self.escape_next = false;
            } else if b == b'\\' {
                self.escape_next = true;
            } else if b == b'"' {
                self.in_string = false;
            }
            return self.check_size();
        }

        match (self.stack.is_empty(), b) {
            // At depth 0: only whitespace or an opening bracket is valid.
            (true, b'{') => {
                self.packet_start = Some(pos);
                self.stack.push(Opener::Brace);
            }
            (true, b'[') => {
                self.packet_start = Some(pos);
                self.stack.push(Opener::Bracket);
            }
            (true, _) if is_json_whitespace(b) => {}
            (true, _) => {
                trace!(byte = b, "rejected top-level non-object/array byte");
                return Err(ParseError);
            }

            // Inside a value: strings, nested brackets, anything else passes through.
            (false, b'"') => {
                self.in_string = true;
            }
            (false, b'{') => {
                self.stack.push(Opener::Brace);
            }
            (false, b'[') => {
                self.stack.push(Opener::Bracket);
            }
            (false, b'}') => {
                if self.stack.pop() != Some(Opener::Brace) {
                    return Err(ParseError);
                }
                self.maybe_emit(pos);
            }
            (false, b']') => {
                if self.stack.pop() != Some(Opener::Bracket) {
                    return Err(ParseError);
                }
                self.maybe_emit(pos);
            }
            (false, _) => {}
        }

        self.check_size()
    }

    fn maybe_emit(&mut self, closing_pos: usize) {
        if self.stack.is_empty() {
            let start = self.packet_start.take().unwrap_or(0);
            let packet = &self.buf[start..=closing_pos];
            if let Some(handler) = self.handler.as_mut() {
                handler(packet);
            }
            // Drop the emitted packet's bytes; anything after stays buffered.
            self.buf.drain(..=closing_pos);
            self.packet_start = None;
        }
    }

    fn check_size(&self) -> Result<(), ParseError> {
        if let Some(max) = self.max_packet_size {
            let in_flight = self.packet_start.map_or(0, |start| self.buf.len() - start);
            if in_flight > max {
                return Err(ParseError);
            }
        }
        Ok(())
    }
}

fn is_json_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn collecting_framer() -> (JsonFramer, Arc<Mutex<Vec<Vec<u8>>>>) {
        let mut framer = JsonFramer::new();
        let packets = Arc::new(Mutex::new(Vec::new()));
        let packets_clone = Arc::clone(&packets);
        framer.set_packet_handler(move |bytes| packets_clone.lock().unwrap().push(bytes.to_vec()));
        (framer, packets)
    }

    #[test]
    fn basic_chunked_two_packets() {
        let (mut framer, packets) = collecting_framer();

        framer.feed(b"   [\"hell").unwrap();
        framer.feed(b"o world!\", 1, 4, fal").unwrap();
        framer.feed(b"se,    456, 4,   ").unwrap();
        framer.feed(b"null]      {\"foo\":1234} ").unwrap();

        let packets = packets.lock().unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(
            packets[0],
            br#"["hello world!", 1, 4, false,    456, 4,   null]"#.to_vec()
        );
        assert_eq!(packets[1], br#"{"foo":1234}"#.to_vec());
    }

    #[test]
    fn reject_top_level_literal() {
        let (mut framer, packets) = collecting_framer();
        let err = framer.feed(b"null").unwrap_err();
        assert_eq!(err, ParseError);
        assert!(packets.lock().unwrap().is_empty());
    }

    #[test]
    fn reject_top_level_number() {
        let (mut framer, _packets) = collecting_framer();
        assert!(framer.feed(b"1").is_err());
    }

    #[test]
    fn single_object() {
        let (mut framer, packets) = collecting_framer();
        framer.feed(b"{}").unwrap();
        assert_eq!(packets.lock().unwrap().as_slice(), &[b"{}".to_vec()]);
    }

    #[test]
    fn byte_by_byte_round_trip() {
        let input = br#"{"a": [1, 2, {"b": "c\"d"}]}"#;
        let (mut framer, packets) = collecting_framer();

        for &b in input {
            framer.feed(&[b]).unwrap();
        }

        assert_eq!(packets.lock().unwrap().as_slice(), &[input.to_vec()]);
    }

    #[test]
    fn escaped_brackets_inside_strings_are_ignored() {
        let (mut framer, packets) = collecting_framer();
        framer.feed(br#"["}]{\"", "done"]"#).unwrap();
        assert_eq!(
            packets.lock().unwrap().as_slice(),
            &[br#"["}]{\"", "done"]"#.to_vec()]
        );
    }

    #[test]
    fn mismatched_brackets_error() {
        let (mut framer, _packets) = collecting_framer();
        assert!(framer.feed(b"[1, 2}").is_err());
    }

    #[test]
    fn reset_allows_resuming() {
        let (mut framer, packets) = collecting_framer();
        assert!(framer.feed(b"null").is_err());
        framer.reset();
        framer.feed(b"[1]").unwrap();
        assert_eq!(packets.lock().unwrap().as_slice(), &[b"[1]".to_vec()]);
    }

    #[test]
    fn max_packet_size_guard() {
        let mut framer = JsonFramer::new();
        framer.set_max_packet_size(4);
        assert!(framer.feed(b"[1, 2, 3, 4, 5]").is_err());
    }

    proptest::proptest! {
        #[test]
        fn any_valid_json_array_or_object_round_trips(value in arbitrary_json_container()) {
            let encoded = serde_json::to_vec(&value).unwrap();
            let (mut framer, packets) = collecting_framer();
            framer.feed(&encoded).unwrap();
            let packets = packets.lock().unwrap();
            prop_assert_eq!(packets.len(), 1);
            prop_assert_eq!(&packets[0], &encoded);
        }
    }

    fn arbitrary_json_container() -> impl proptest::strategy::Strategy<Value = serde_json::Value> {
        use proptest::prelude::*;

        let leaf = prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::Bool),
            any::<i64>().prop_map(|n| serde_json::Value::Number(n.into())),
            "[a-zA-Z0-9 ]{0,12}".prop_map(serde_json::Value::String),
        ];

        prop_oneof![
            prop::collection::vec(leaf.clone(), 0..6).prop_map(|v| serde_json::Value::Array(v)),
            prop::collection::vec(("[a-z]{1,6}", leaf), 0..6)
                .prop_map(|entries| serde_json::Value::Object(entries.into_iter().collect())),
        ]
    }
}
