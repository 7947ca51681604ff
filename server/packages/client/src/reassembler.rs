use agent_relay_chat_schema::{decode_line_bytes, UiMessage};

/// Incremental NDJSON decoder for a chunked response body.
///
/// Bytes are buffered raw and only complete lines are decoded, so a multi-byte character
/// split across chunks is reassembled before UTF-8 validation.
#[derive(Debug, Default)]
pub struct NdjsonReassembler {
    buffer: Vec<u8>,
    dropped: u64,
}

impl NdjsonReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed arbitrary bytes and drain every message completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<UiMessage> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();

        while let Some(split) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=split).collect();
            if let Some(message) = self.decode(&line[..split]) {
                messages.push(message);
            }
        }

        messages
    }

    /// Decode a trailing fragment left without a final newline.
    pub fn finish(&mut self) -> Option<UiMessage> {
        let rest = std::mem::take(&mut self.buffer);
        self.decode(&rest)
    }

    /// Lines that were non-blank but failed to decode.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.iter().all(u8::is_ascii_whitespace)
    }

    fn decode(&mut self, line: &[u8]) -> Option<UiMessage> {
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        match decode_line_bytes(line) {
            Ok(message) => Some(message),
            Err(err) => {
                self.dropped += 1;
                tracing::warn!(
                    error = %err,
                    line_bytes = line.len(),
                    raw = %truncate_for_log(line),
                    "dropping undecodable stream line"
                );
                None
            }
        }
    }
}

fn truncate_for_log(line: &[u8]) -> String {
    let text = String::from_utf8_lossy(line);
    if text.chars().count() > 200 {
        format!("{}...", text.chars().take(200).collect::<String>())
    } else {
        text.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_relay_chat_schema::encode_line;

    fn sample() -> Vec<UiMessage> {
        vec![
            UiMessage::text("Grüße aus Köln 🦀"),
            UiMessage::tool_call("Read", "toolu_1", ""),
            UiMessage::tool_call("", "toolu_1", "{\"file\":\"ü.rs\"}"),
            UiMessage::tool_result("toolu_1", "ok"),
            UiMessage::RunResult {
                subtype: "success".to_string(),
                cost_usd: 0.02,
                duration_ms: 1500,
            },
        ]
    }

    fn encoded(messages: &[UiMessage]) -> Vec<u8> {
        messages
            .iter()
            .flat_map(|message| encode_line(message).expect("encode"))
            .collect()
    }

    #[test]
    fn every_split_point_yields_the_same_sequence() {
        let messages = sample();
        let bytes = encoded(&messages);
        for split in 0..=bytes.len() {
            let mut reassembler = NdjsonReassembler::new();
            let mut out = reassembler.push(&bytes[..split]);
            out.extend(reassembler.push(&bytes[split..]));
            out.extend(reassembler.finish());
            assert_eq!(out, messages, "split at byte {split}");
        }
    }

    #[test]
    fn byte_at_a_time_feed_survives_multibyte_characters() {
        let messages = sample();
        let mut reassembler = NdjsonReassembler::new();
        let mut out = Vec::new();
        for byte in encoded(&messages) {
            out.extend(reassembler.push(&[byte]));
        }
        assert!(reassembler.is_empty_buffer());
        assert_eq!(out, messages);
    }

    #[test]
    fn blank_lines_are_skipped_silently() {
        let mut reassembler = NdjsonReassembler::new();
        let out = reassembler.push(b"\n  \n{\"type\":\"text\",\"text\":\"hi\"}\r\n\n");
        assert_eq!(out, vec![UiMessage::text("hi")]);
        assert_eq!(reassembler.dropped(), 0);
    }

    #[test]
    fn trailing_fragment_is_decoded_on_finish() {
        let mut reassembler = NdjsonReassembler::new();
        assert!(reassembler
            .push(b"{\"type\":\"status\",\"status\":\"working\"}")
            .is_empty());
        assert_eq!(reassembler.finish(), Some(UiMessage::status("working")));
        assert_eq!(reassembler.finish(), None);
    }

    #[test]
    fn one_malformed_line_in_ten_is_dropped() {
        let mut bytes = Vec::new();
        let mut expected = Vec::new();
        for index in 0..10 {
            if index == 4 {
                bytes.extend_from_slice(b"{\"type\":\"text\",\"text\":\n");
                continue;
            }
            let message = UiMessage::text(format!("line {index}"));
            bytes.extend(encode_line(&message).expect("encode"));
            expected.push(message);
        }

        let mut reassembler = NdjsonReassembler::new();
        let mut out = Vec::new();
        for chunk in bytes.chunks(7) {
            out.extend(reassembler.push(chunk));
        }
        assert_eq!(out.len(), 9);
        assert_eq!(out, expected);
        assert_eq!(reassembler.dropped(), 1);
    }
}
