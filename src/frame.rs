//! Stateless telemetry frame decoding.
//!
//! The transport delivers one frame at a time (a line on the stream link,
//! a notification payload on the BLE link). Two wire encodings exist for
//! the same data: space-separated ASCII-hex byte tokens, and a fixed
//! 13-byte binary packet (optionally base64-armoured). Both funnel into
//! the same [`Module`]/[`Cell`] model and the same validation.

use crate::state::{Cell, Module};
use base64::Engine;
use tracing::debug;

/// Cells per module. Fixed by the pack hardware.
pub const CELLS_PER_MODULE: usize = 6;

/// Number of module addresses after the base that carry telemetry.
pub const MODULE_ADDR_WINDOW: u16 = 16;

/// The high bit of a raw cell word is a flag, not part of the voltage.
const VOLTAGE_MASK: u16 = 0x7FFF;

/// Raw cell words are millivolts. Readings outside this range are
/// physically impossible for these cells and are rejected.
const CELL_VOLTAGE_MIN_MV: u16 = 2800;
const CELL_VOLTAGE_MAX_MV: u16 = 4250;

/// Fixed binary packet layout: module id byte + 6 big-endian cell words.
const PACKET_LEN: usize = 1 + 2 * CELLS_PER_MODULE;

/// Wire encoding of incoming frames, fixed by the transport in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Space-separated ASCII-hex byte tokens, line-framed.
    AsciiHex,
    /// 13-byte binary packets, raw or base64-armoured, packet-framed.
    Packet,
}

/// Outcome of decoding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A telemetry frame: one module's worth of cell readings.
    Telemetry(Module),
    /// Not a telemetry frame. Forwarded as text so command responses and
    /// status strings still reach the session matcher.
    Unrecognized(String),
    /// A telemetry-addressed frame too damaged to decode. Dropped.
    Malformed,
}

/// Decoder for one transport's frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameParser {
    codec: Codec,
    module_base: u16,
}

impl FrameParser {
    pub fn new(codec: Codec, module_base: u16) -> Self {
        Self { codec, module_base }
    }

    /// Decode a single frame as delivered by the transport.
    pub fn decode(&self, chunk: &[u8]) -> Decoded {
        match self.codec {
            Codec::AsciiHex => self.decode_ascii(chunk),
            Codec::Packet => self.decode_packet(chunk),
        }
    }

    fn decode_ascii(&self, chunk: &[u8]) -> Decoded {
        let text = String::from_utf8_lossy(chunk);
        let trimmed = text.trim_matches(|c: char| c.is_whitespace() || c == '>');
        if trimmed.is_empty() {
            return Decoded::Malformed;
        }

        let mut tokens = trimmed.split_whitespace();
        // Address prefix matching is case-insensitive; from_str_radix
        // accepts either case.
        let addr = match tokens.next().and_then(|t| u16::from_str_radix(t, 16).ok()) {
            Some(addr) => addr,
            None => return Decoded::Unrecognized(trimmed.to_string()),
        };

        let offset = addr.wrapping_sub(self.module_base);
        if offset >= MODULE_ADDR_WINDOW {
            return Decoded::Unrecognized(trimmed.to_string());
        }

        let mut bytes = Vec::with_capacity(2 * CELLS_PER_MODULE);
        for token in tokens {
            match u8::from_str_radix(token, 16) {
                Ok(b) if token.len() <= 2 => bytes.push(b),
                _ => {
                    debug!(frame = %trimmed, token, "malformed byte token in telemetry frame");
                    return Decoded::Malformed;
                }
            }
        }
        if bytes.len() < 2 {
            // Truncated mid-line; wait for the next frame.
            debug!(frame = %trimmed, "telemetry frame with no complete cell word");
            return Decoded::Malformed;
        }

        Decoded::Telemetry(build_module(offset as u8, &bytes))
    }

    fn decode_packet(&self, chunk: &[u8]) -> Decoded {
        // Notifications may carry the packet base64-armoured.
        if let Ok(text) = std::str::from_utf8(chunk) {
            let trimmed = text.trim();
            if let Ok(raw) = base64::engine::general_purpose::STANDARD.decode(trimmed) {
                if raw.len() == PACKET_LEN && u16::from(raw[0]) < MODULE_ADDR_WINDOW {
                    return Decoded::Telemetry(build_module(raw[0], &raw[1..]));
                }
            }
        }

        if chunk.len() == PACKET_LEN && u16::from(chunk[0]) < MODULE_ADDR_WINDOW {
            return Decoded::Telemetry(build_module(chunk[0], &chunk[1..]));
        }

        Decoded::Unrecognized(String::from_utf8_lossy(chunk).trim().to_string())
    }
}

/// Assemble a module from its id and however many payload bytes arrived.
///
/// Cell positions with a complete big-endian word get a validated reading;
/// positions past the end of the payload stay empty. A word of zero is a
/// genuine 0.000 V reading, which the range check then rejects — absence
/// is signalled only by missing bytes, never by value.
fn build_module(id: u8, bytes: &[u8]) -> Module {
    let cells = std::array::from_fn(|i| {
        let pos = 2 * i;
        match (bytes.get(pos), bytes.get(pos + 1)) {
            (Some(&hi), Some(&lo)) => {
                let raw = u16::from_be_bytes([hi, lo]) & VOLTAGE_MASK;
                if (CELL_VOLTAGE_MIN_MV..=CELL_VOLTAGE_MAX_MV).contains(&raw) {
                    Cell {
                        id: i as u8 + 1,
                        voltage: Some(f32::from(raw) / 1000.0),
                        is_critical: false,
                    }
                } else {
                    Cell {
                        id: i as u8 + 1,
                        voltage: None,
                        is_critical: true,
                    }
                }
            }
            _ => Cell::empty(i as u8 + 1),
        }
    });
    Module { id, cells }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u16 = 0x6F2;

    fn ascii() -> FrameParser {
        FrameParser::new(Codec::AsciiHex, BASE)
    }

    fn packet() -> FrameParser {
        FrameParser::new(Codec::Packet, BASE)
    }

    fn expect_module(decoded: Decoded) -> Module {
        match decoded {
            Decoded::Telemetry(m) => m,
            other => panic!("expected telemetry, got {other:?}"),
        }
    }

    #[test]
    fn decodes_full_frame_at_base_address() {
        let m = expect_module(ascii().decode(b"6F2 0C 80 0C 80 0C 80 0C 80 0C 80 0C 80"));
        assert_eq!(m.id, 0);
        for cell in &m.cells {
            assert_eq!(cell.voltage, Some(3.2));
            assert!(!cell.is_critical);
        }
    }

    #[test]
    fn module_id_is_offset_from_base() {
        let m = expect_module(ascii().decode(b"6F7 0C 80 0C 80 0C 80 0C 80 0C 80 0C 80"));
        assert_eq!(m.id, 5);
    }

    #[test]
    fn address_matching_is_case_insensitive() {
        let m = expect_module(ascii().decode(b"6f2 0c 80 0c 80 0c 80 0c 80 0c 80 0c 80"));
        assert_eq!(m.id, 0);
    }

    #[test]
    fn prompt_and_padding_are_stripped() {
        let m = expect_module(ascii().decode(b"> 6F2 0F A0 0F A0 0F A0 0F A0 0F A0 0F A0 >"));
        assert_eq!(m.cells[0].voltage, Some(4.0));
    }

    #[test]
    fn high_flag_bit_is_masked_off() {
        // 0x8C80 & 0x7FFF = 0x0C80 = 3200 mV
        let m = expect_module(ascii().decode(b"6F2 8C 80 0C 80 0C 80 0C 80 0C 80 0C 80"));
        assert_eq!(m.cells[0].voltage, Some(3.2));
        assert!(!m.cells[0].is_critical);
    }

    #[test]
    fn out_of_range_reading_is_critical_not_missing() {
        // 0x1388 = 5000 mV, above the valid window.
        let m = expect_module(ascii().decode(b"6F2 13 88 0C 80 0C 80 0C 80 0C 80 0C 80"));
        assert_eq!(m.cells[0].voltage, None);
        assert!(m.cells[0].is_critical);
        assert_eq!(m.cells[1].voltage, Some(3.2));
    }

    #[test]
    fn zero_word_is_a_reading_not_absence() {
        let m = expect_module(ascii().decode(b"6F2 00 00 0C 80 0C 80 0C 80 0C 80 0C 80"));
        // Received, but 0.000 V fails the range check.
        assert_eq!(m.cells[0].voltage, None);
        assert!(m.cells[0].is_critical);
    }

    #[test]
    fn missing_pair_is_absent_not_critical() {
        // Three complete words, then one orphan byte.
        let m = expect_module(ascii().decode(b"6F2 0C 80 0C 80 0C 80 0C"));
        assert_eq!(m.cells[2].voltage, Some(3.2));
        assert_eq!(m.cells[3].voltage, None);
        assert!(!m.cells[3].is_critical);
        assert_eq!(m.cells[5].voltage, None);
        assert!(!m.cells[5].is_critical);
    }

    #[test]
    fn range_bounds_are_inclusive() {
        // 0x0AF0 = 2800 mV, 0x109A = 4250 mV.
        let m = expect_module(ascii().decode(b"6F2 0A F0 10 9A 0A EF 10 9B 0C 80 0C 80"));
        assert_eq!(m.cells[0].voltage, Some(2.8));
        assert_eq!(m.cells[1].voltage, Some(4.25));
        assert!(m.cells[2].is_critical); // 2799
        assert!(m.cells[3].is_critical); // 4251
    }

    #[test]
    fn status_strings_are_forwarded_unrecognized() {
        for raw in [&b"OK"[..], b"ELM327 v1.5", b"NO DATA", b"7EC 03 54 FF 00"] {
            match ascii().decode(raw) {
                Decoded::Unrecognized(text) => {
                    assert_eq!(text.as_bytes(), raw);
                }
                other => panic!("expected unrecognized for {raw:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn address_outside_window_is_unrecognized() {
        // 0x702 is base + 16, one past the window.
        assert!(matches!(
            ascii().decode(b"702 0C 80 0C 80 0C 80 0C 80 0C 80 0C 80"),
            Decoded::Unrecognized(_)
        ));
        assert!(matches!(
            ascii().decode(b"6F1 0C 80"),
            Decoded::Unrecognized(_)
        ));
    }

    #[test]
    fn bad_byte_token_voids_the_frame() {
        assert_eq!(ascii().decode(b"6F2 0C 80 ZZ 80"), Decoded::Malformed);
        assert_eq!(ascii().decode(b"6F2 0C801 0C 80"), Decoded::Malformed);
    }

    #[test]
    fn frame_without_a_complete_word_is_malformed() {
        assert_eq!(ascii().decode(b"6F2"), Decoded::Malformed);
        assert_eq!(ascii().decode(b"6F2 0C"), Decoded::Malformed);
        assert_eq!(ascii().decode(b"   "), Decoded::Malformed);
    }

    #[test]
    fn raw_packet_decodes() {
        let mut raw = vec![3u8];
        for _ in 0..CELLS_PER_MODULE {
            raw.extend_from_slice(&0x0C80u16.to_be_bytes());
        }
        let m = expect_module(packet().decode(&raw));
        assert_eq!(m.id, 3);
        assert!(m.cells.iter().all(|c| c.voltage == Some(3.2)));
    }

    #[test]
    fn base64_packet_decodes() {
        let mut raw = vec![7u8];
        for _ in 0..CELLS_PER_MODULE {
            raw.extend_from_slice(&0x0FA0u16.to_be_bytes());
        }
        let armoured = base64::engine::general_purpose::STANDARD.encode(&raw);
        let m = expect_module(packet().decode(armoured.as_bytes()));
        assert_eq!(m.id, 7);
        assert_eq!(m.cells[0].voltage, Some(4.0));
    }

    #[test]
    fn packet_validation_matches_ascii_validation() {
        let mut raw = vec![0u8];
        raw.extend_from_slice(&0x0000u16.to_be_bytes()); // 0 mV: critical
        raw.extend_from_slice(&0x8C80u16.to_be_bytes()); // flag bit masked: 3.2 V
        raw.extend_from_slice(&0x1388u16.to_be_bytes()); // 5000 mV: critical
        raw.extend_from_slice(&0x0AF0u16.to_be_bytes());
        raw.extend_from_slice(&0x109Au16.to_be_bytes());
        raw.extend_from_slice(&0x0C80u16.to_be_bytes());
        let m = expect_module(packet().decode(&raw));
        assert!(m.cells[0].is_critical);
        assert_eq!(m.cells[1].voltage, Some(3.2));
        assert!(m.cells[2].is_critical);
        assert_eq!(m.cells[3].voltage, Some(2.8));
        assert_eq!(m.cells[4].voltage, Some(4.25));
    }

    #[test]
    fn wrong_length_packet_is_unrecognized() {
        assert!(matches!(
            packet().decode(&[1, 2, 3, 4]),
            Decoded::Unrecognized(_)
        ));
    }

    #[test]
    fn packet_text_response_is_forwarded() {
        match packet().decode(b"7F 14 11\r") {
            Decoded::Unrecognized(text) => assert_eq!(text, "7F 14 11"),
            other => panic!("expected unrecognized, got {other:?}"),
        }
    }
}
