// src/pdu.rs

//! GSM 03.40 helpers for the SMS engine.
//!
//! - 7-bit default alphabet packing and unpacking.
//! - Swapped-nibble BCD address fields.
//! - SMS-DELIVER construction and SMS-SUBMIT parsing.

use chrono::{DateTime, Datelike, FixedOffset, Offset, TimeZone, Timelike};

/// Type-of-address byte for international numbers.
const TOA_INTERNATIONAL: u8 = 0x91;
/// Type-of-address byte for unknown numbering plans.
const TOA_UNKNOWN: u8 = 0x81;

const MTI_MASK: u8 = 0x03;
const MTI_DELIVER: u8 = 0x00;
const MTI_SUBMIT: u8 = 0x01;
const UDHI: u8 = 0x40;
const VPF_MASK: u8 = 0x18;

const DCS_ALPHABET_MASK: u8 = 0x0C;
const DCS_GSM7: u8 = 0x00;
const DCS_UCS2: u8 = 0x08;

/// Packs 7-bit values low-order-first. `n` septets fill `ceil(7n/8)` bytes.
pub fn pack_gsm7(septets: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity((septets.len() * 7).div_ceil(8));
    let mut acc: u32 = 0;
    let mut bits = 0;
    for &s in septets {
        acc |= u32::from(s & 0x7F) << bits;
        bits += 7;
        while bits >= 8 {
            out.push(acc as u8);
            acc >>= 8;
            bits -= 8;
        }
    }
    if bits > 0 {
        out.push(acc as u8);
    }
    out
}

/// Extracts `count` septets from packed bytes, stopping early if the input runs out.
#[cfg(test)]
pub fn unpack_gsm7(packed: &[u8], count: usize) -> Vec<u8> {
    unpack_gsm7_from(packed, count, 0)
}

/// Like [`unpack_gsm7`] but skips `skip_bits` leading bits (fill bits after a UDH).
fn unpack_gsm7_from(packed: &[u8], count: usize, skip_bits: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let bit = skip_bits + i * 7;
        let byte = bit / 8;
        let shift = bit % 8;
        let Some(&lo) = packed.get(byte) else {
            break;
        };
        let hi = packed.get(byte + 1).copied().unwrap_or(0);
        let word = u16::from(lo) | (u16::from(hi) << 8);
        out.push(((word >> shift) & 0x7F) as u8);
    }
    out
}

/// Maps text to septets, replacing anything outside 7-bit ASCII with `?`.
pub fn to_septets(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect()
}

/// Keeps only the ASCII digits of `number`.
pub fn digits_of(number: &[u8]) -> String {
    number
        .iter()
        .filter(|b| b.is_ascii_digit())
        .map(|&b| b as char)
        .collect()
}

/// Encodes a phone number as an address field: digit count, type of address, BCD digits.
pub fn encode_address(number: &str) -> Vec<u8> {
    let digits = digits_of(number.as_bytes());
    let toa = if number.starts_with('+') {
        TOA_INTERNATIONAL
    } else {
        TOA_UNKNOWN
    };
    let mut out = vec![digits.len() as u8, toa];
    out.extend(encode_bcd(&digits));
    out
}

fn encode_bcd(digits: &str) -> Vec<u8> {
    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let lo = pair[0] - b'0';
            let hi = pair.get(1).map_or(0x0F, |d| d - b'0');
            (hi << 4) | lo
        })
        .collect()
}

fn decode_bcd(bytes: &[u8], digits: usize) -> String {
    let mut out = String::with_capacity(digits);
    for &b in bytes {
        for nibble in [b & 0x0F, b >> 4] {
            if out.len() == digits || nibble > 9 {
                return out;
            }
            out.push(char::from(b'0' + nibble));
        }
    }
    out
}

fn semi_octet(value: u32) -> u8 {
    let v = (value % 100) as u8;
    ((v % 10) << 4) | (v / 10)
}

/// Encodes a service-centre timestamp: seven swapped-nibble octets, the last
/// being the UTC offset in quarter hours with bit 3 as the sign.
pub fn encode_timestamp<Tz: TimeZone>(when: &DateTime<Tz>) -> [u8; 7] {
    let offset = when.offset().fix().local_minus_utc();
    let quarters = (offset.unsigned_abs() / 900) as u8;
    let mut tz = ((quarters % 10) << 4) | (quarters / 10);
    if offset < 0 {
        tz |= 0x08;
    }
    [
        semi_octet(when.year().unsigned_abs()),
        semi_octet(when.month()),
        semi_octet(when.day()),
        semi_octet(when.hour()),
        semi_octet(when.minute()),
        semi_octet(when.second()),
        tz,
    ]
}

/// Fixed timestamp used while the clock has not been set from the network.
pub fn placeholder_timestamp() -> DateTime<FixedOffset> {
    FixedOffset::east_opt(0)
        .and_then(|utc| utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).single())
        .unwrap_or_default()
}

/// Builds an SMS-DELIVER TPDU from `sender` carrying `text` (at most 160 septets).
pub fn build_deliver<Tz: TimeZone>(sender: &str, text: &str, when: &DateTime<Tz>) -> Vec<u8> {
    let septets = to_septets(text);
    let mut pdu = Vec::with_capacity(32 + septets.len());
    // No SMSC information.
    pdu.push(0x00);
    // SMS-DELIVER, no more messages to send.
    pdu.push(MTI_DELIVER | 0x04);
    pdu.extend(encode_address(sender));
    pdu.push(0x00); // TP-PID
    pdu.push(DCS_GSM7);
    pdu.extend_from_slice(&encode_timestamp(when));
    pdu.push(septets.len() as u8);
    pdu.extend(pack_gsm7(&septets));
    pdu
}

/// The parts of an outgoing SMS-SUBMIT the daemon cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submit {
    pub destination: String,
    pub text: String,
}

/// Parses an SMS-SUBMIT TPDU prefixed by its SMSC information field.
pub fn parse_submit(pdu: &[u8]) -> Option<Submit> {
    let smsc_len = usize::from(*pdu.first()?);
    let mut pos = 1 + smsc_len;
    let first = *pdu.get(pos)?;
    if first & MTI_MASK != MTI_SUBMIT {
        return None;
    }
    pos += 2; // first octet, message reference
    let digits = usize::from(*pdu.get(pos)?);
    pos += 2; // length, type of address
    let number_bytes = digits.div_ceil(2);
    let destination = decode_bcd(pdu.get(pos..pos + number_bytes)?, digits);
    pos += number_bytes;
    pos += 1; // TP-PID
    let dcs = *pdu.get(pos)?;
    pos += 1;
    pos += match first & VPF_MASK {
        0x00 => 0,
        0x10 => 1,
        _ => 7,
    };
    let udl = usize::from(*pdu.get(pos)?);
    pos += 1;
    let ud = pdu.get(pos..)?;

    let text = match dcs & DCS_ALPHABET_MASK {
        DCS_GSM7 => {
            let (skip_bits, skip_septets) = if first & UDHI != 0 {
                let udh_bits = (usize::from(*ud.first()?) + 1) * 8;
                (udh_bits.div_ceil(7) * 7, udh_bits.div_ceil(7))
            } else {
                (0, 0)
            };
            let septets = unpack_gsm7_from(ud, udl.saturating_sub(skip_septets), skip_bits);
            septets.into_iter().map(char::from).collect()
        }
        DCS_UCS2 => {
            let body = if first & UDHI != 0 {
                ud.get(usize::from(*ud.first()?) + 1..)?
            } else {
                ud
            };
            let units: Vec<u16> = body
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        _ => return None,
    };
    Some(Submit { destination, text })
}

/// Splits `text` into chunks that each fit in one SMS-DELIVER.
pub fn split_for_sms(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return vec![String::new()];
    }
    chars
        .chunks(crate::constants::MAX_SMS_SEPTETS)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Builds a SUBMIT the way a handset would send it.
#[cfg(test)]
pub(crate) fn submit_pdu(destination: &str, text: &str) -> Vec<u8> {
    let septets = to_septets(text);
    let mut pdu = vec![0x00, 0x01, 0x00];
    pdu.extend(encode_address(destination));
    pdu.push(0x00);
    pdu.push(0x00);
    pdu.push(septets.len() as u8);
    pdu.extend(pack_gsm7(&septets));
    pdu
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn packs_the_classic_hello() {
        assert_eq!(pack_gsm7(b"hellohello"), vec![0xE8, 0x32, 0x9B, 0xFD, 0x46, 0x97, 0xD9, 0xEC, 0x37]);
        assert_eq!(unpack_gsm7(&pack_gsm7(b"hellohello"), 10), b"hellohello");
    }

    #[test]
    fn eight_septets_fill_seven_bytes() {
        assert_eq!(pack_gsm7(b"12345678").len(), 7);
        assert_eq!(pack_gsm7(b"1234567").len(), 7);
        assert_eq!(pack_gsm7(b"123456789").len(), 8);
    }

    #[test]
    fn addresses_use_swapped_bcd() {
        assert_eq!(encode_address("+123"), vec![3, 0x91, 0x21, 0xF3]);
        assert_eq!(decode_bcd(&[0x21, 0xF3], 3), "123");
        assert_eq!(digits_of(b" +22-33 44\0\0"), "223344");
    }

    #[test]
    fn timestamps_encode_offset_in_quarter_hours() {
        let tz = FixedOffset::west_opt(5 * 3600).unwrap();
        let when = tz.with_ymd_and_hms(2024, 3, 9, 17, 45, 30).unwrap();
        assert_eq!(encode_timestamp(&when), [0x42, 0x30, 0x90, 0x71, 0x54, 0x03, 0x02 | 0x08]);
    }

    #[test]
    fn deliver_carries_sender_and_text() {
        let when = placeholder_timestamp();
        let pdu = build_deliver("+223344556677", "Hi", &when);
        assert_eq!(&pdu[..4], &[0x00, 0x04, 12, 0x91]);
        // smsc, first octet, address (2 + 6), pid, dcs, scts (7)
        let udl_at = 2 + 8 + 2 + 7;
        assert_eq!(pdu[udl_at], 2);
        assert_eq!(unpack_gsm7(&pdu[udl_at + 1..], 2), b"Hi");
    }

    #[test]
    fn parses_a_submit() {
        let pdu = submit_pdu("+223344556677", "call me");
        assert_eq!(
            parse_submit(&pdu),
            Some(Submit {
                destination: "223344556677".into(),
                text: "call me".into()
            })
        );
    }

    #[test]
    fn parses_a_ucs2_submit_with_validity_period() {
        let mut pdu = vec![0x00, 0x11, 0x00];
        pdu.extend(encode_address("5550"));
        pdu.extend_from_slice(&[0x00, 0x08, 0xAA, 4, 0x00, b'o', 0x00, b'k']);
        assert_eq!(parse_submit(&pdu).unwrap().text, "ok");
    }

    #[test]
    fn rejects_deliver_and_truncated_pdus() {
        let deliver = build_deliver("+1", "x", &placeholder_timestamp());
        assert_eq!(parse_submit(&deliver), None);
        let submit = submit_pdu("+223344556677", "hello");
        assert_eq!(parse_submit(&submit[..6]), None);
    }

    #[test]
    fn long_text_is_split_on_septet_boundaries() {
        let text = "a".repeat(321);
        let parts = split_for_sms(&text);
        assert_eq!(parts.iter().map(String::len).collect::<Vec<_>>(), vec![160, 160, 1]);
    }

    proptest! {
        #[test]
        fn gsm7_packing_is_a_bijection(text in "[ -~]{1,160}") {
            let septets = to_septets(&text);
            let packed = pack_gsm7(&septets);
            prop_assert_eq!(packed.len(), (7 * septets.len()).div_ceil(8));
            prop_assert_eq!(unpack_gsm7(&packed, septets.len()), septets);
        }
    }
}
