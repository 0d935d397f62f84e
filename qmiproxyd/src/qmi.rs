// src/qmi.rs

//! QMUX/QMI frame codec.
//!
//! Every frame handled by the proxy has three layers:
//!
//! ```text
//! +--------+---------+-------+---------+--------+ +-----+--------+--------+---------+ +------+--------+-------+
//! | marker | qmux len| flags | service | client | | ctl | txn id | msg id | qmi len | | type | length | value | ...
//! |  0x01  |  u16 LE |  u8   |   u8    |   u8   | | u8  | u16/u8 | u16 LE | u16 LE  | |  u8  | u16 LE |  [N]  |
//! +--------+---------+-------+---------+--------+ +-----+--------+--------+---------+ +------+--------+-------+
//! ```
//!
//! The control service (0) carries a one-byte transaction id, every other
//! service carries two. The QMUX length counts everything after the marker.
//!
//! All functions here are pure transforms over caller-supplied buffers. Input
//! comes from two untrusted peripherals, so every access is bounds checked and
//! nothing is reinterpreted in place.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use crate::constants::{QmuxFlags, Service};

/// Leading byte of every QMUX frame.
pub const QMUX_MARKER: u8 = 0x01;
/// Marker, length, flags, service, client.
pub const QMUX_HEADER_LEN: usize = 6;
/// Control flags, u16 transaction id, message id, payload length.
pub const QMI_HEADER_LEN: usize = 7;
/// The control service uses a one-byte transaction id.
pub const CTL_HEADER_LEN: usize = 6;
/// Type byte plus u16 length.
pub const TLV_HEADER_LEN: usize = 3;
/// Largest frame the proxy will build or read in one go.
pub const MAX_FRAME_LEN: usize = 4096;

/// Result TLV carried by every response.
pub const TLV_RESULT: u8 = 0x02;
/// Client id broadcast to every control point of a service.
pub const BROADCAST_CLIENT: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame too short: need {needed} bytes, got {actual}")]
    TooShort { needed: usize, actual: usize },
    #[error("declared length {declared} does not fit in {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("frame would exceed its {capacity}-byte buffer")]
    BufferFull { capacity: usize },
}

/// The kind of a QMI message, independent of the service's flag encoding.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum MessageKind {
    Request,
    Response,
    Indication,
}

#[derive(Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive, Copy, Clone)]
#[repr(u8)]
enum ServiceKindByte {
    Request = 0x00,
    Response = 0x02,
    Indication = 0x04,
}

#[derive(Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive, Copy, Clone)]
#[repr(u8)]
enum ControlKindByte {
    Request = 0x00,
    Response = 0x01,
    Indication = 0x02,
}

impl MessageKind {
    /// Encodes the kind into the QMI control flags byte for `service`.
    pub fn to_byte(self, service: u8) -> u8 {
        if is_control(service) {
            match self {
                MessageKind::Request => ControlKindByte::Request,
                MessageKind::Response => ControlKindByte::Response,
                MessageKind::Indication => ControlKindByte::Indication,
            }
            .into()
        } else {
            match self {
                MessageKind::Request => ServiceKindByte::Request,
                MessageKind::Response => ServiceKindByte::Response,
                MessageKind::Indication => ServiceKindByte::Indication,
            }
            .into()
        }
    }

    /// Decodes the QMI control flags byte; unknown bits yield `None`.
    pub fn from_byte(service: u8, byte: u8) -> Option<Self> {
        if is_control(service) {
            ControlKindByte::try_from(byte).ok().map(|k| match k {
                ControlKindByte::Request => MessageKind::Request,
                ControlKindByte::Response => MessageKind::Response,
                ControlKindByte::Indication => MessageKind::Indication,
            })
        } else {
            ServiceKindByte::try_from(byte).ok().map(|k| match k {
                ServiceKindByte::Request => MessageKind::Request,
                ServiceKindByte::Response => MessageKind::Response,
                ServiceKindByte::Indication => MessageKind::Indication,
            })
        }
    }
}

fn is_control(service: u8) -> bool {
    service == u8::from(Service::Control)
}

fn qmi_header_len(service: u8) -> usize {
    if is_control(service) {
        CTL_HEADER_LEN
    } else {
        QMI_HEADER_LEN
    }
}

fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    let b = bytes.get(at..at + 2)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

/// Decoded QMUX and QMI headers of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub qmux_len: u16,
    pub flags: QmuxFlags,
    pub service: u8,
    pub client_id: u8,
    pub ctl: u8,
    pub transaction_id: u16,
    pub message_id: u16,
    pub qmi_len: u16,
}

impl Header {
    /// Offset of the first TLV.
    pub fn tlv_start(&self) -> usize {
        QMUX_HEADER_LEN + qmi_header_len(self.service)
    }

    /// Offset one past the last payload byte, as declared.
    pub fn payload_end(&self) -> usize {
        self.tlv_start() + usize::from(self.qmi_len)
    }

    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::from_byte(self.service, self.ctl)
    }

    pub fn service(&self) -> Option<Service> {
        Service::try_from(self.service).ok()
    }
}

/// Parses the QMUX and QMI headers at the start of `bytes`.
pub fn parse_header(bytes: &[u8]) -> Result<Header, FrameError> {
    if bytes.len() < QMUX_HEADER_LEN {
        return Err(FrameError::TooShort {
            needed: QMUX_HEADER_LEN,
            actual: bytes.len(),
        });
    }
    let service = bytes[4];
    let tlv_start = QMUX_HEADER_LEN + qmi_header_len(service);
    if bytes.len() < tlv_start {
        return Err(FrameError::TooShort {
            needed: tlv_start,
            actual: bytes.len(),
        });
    }

    let qmux_len = u16::from_le_bytes([bytes[1], bytes[2]]);
    if usize::from(qmux_len) + 1 > bytes.len() {
        return Err(FrameError::LengthMismatch {
            declared: usize::from(qmux_len) + 1,
            actual: bytes.len(),
        });
    }

    let q = QMUX_HEADER_LEN;
    let (transaction_id, rest) = if is_control(service) {
        (u16::from(bytes[q + 1]), q + 2)
    } else {
        (u16::from_le_bytes([bytes[q + 1], bytes[q + 2]]), q + 3)
    };
    let header = Header {
        qmux_len,
        flags: QmuxFlags::from_bits_retain(bytes[3]),
        service,
        client_id: bytes[5],
        ctl: bytes[q],
        transaction_id,
        message_id: u16::from_le_bytes([bytes[rest], bytes[rest + 1]]),
        qmi_len: u16::from_le_bytes([bytes[rest + 2], bytes[rest + 3]]),
    };
    if header.payload_end() > usize::from(qmux_len) + 1 {
        return Err(FrameError::LengthMismatch {
            declared: header.payload_end(),
            actual: usize::from(qmux_len) + 1,
        });
    }
    Ok(header)
}

/// Finds the offset of the first TLV of type `id`.
///
/// The scan starts right after the QMI header and never looks past the
/// declared payload length or the end of the buffer, whichever comes first.
/// A record whose declared length would cross that limit ends the scan.
pub fn find_tlv(bytes: &[u8], id: u8) -> Option<usize> {
    let header = parse_header(bytes).ok()?;
    let end = header.payload_end().min(bytes.len());
    let mut offset = header.tlv_start();
    while offset + TLV_HEADER_LEN <= end {
        let len = usize::from(read_u16(bytes, offset + 1)?);
        if offset + TLV_HEADER_LEN + len > end {
            return None;
        }
        if bytes[offset] == id {
            return Some(offset);
        }
        offset += TLV_HEADER_LEN + len;
    }
    None
}

/// Returns the value of the first TLV of type `id`.
pub fn tlv_value(bytes: &[u8], id: u8) -> Option<&[u8]> {
    let offset = find_tlv(bytes, id)?;
    let len = usize::from(read_u16(bytes, offset + 1)?);
    bytes.get(offset + TLV_HEADER_LEN..offset + TLV_HEADER_LEN + len)
}

/// Whether the result TLV of a response reports success.
pub fn result_ok(bytes: &[u8]) -> bool {
    tlv_value(bytes, TLV_RESULT)
        .and_then(|v| read_u16(v, 0))
        .is_some_and(|code| code == 0)
}

/// Starts a frame with empty payload; see [`FrameBuilder::add_tlv`].
pub fn build_header(
    flags: QmuxFlags,
    service: u8,
    client_id: u8,
    kind: MessageKind,
    transaction_id: u16,
    message_id: u16,
) -> FrameBuilder {
    FrameBuilder::new(flags, service, client_id, kind, transaction_id, message_id)
}

/// Incrementally assembles a frame, keeping both length fields current.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    buf: Vec<u8>,
    capacity: usize,
}

impl FrameBuilder {
    pub fn new(
        flags: QmuxFlags,
        service: u8,
        client_id: u8,
        kind: MessageKind,
        transaction_id: u16,
        message_id: u16,
    ) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.push(QMUX_MARKER);
        buf.extend_from_slice(&[0, 0]);
        buf.push(flags.bits());
        buf.push(service);
        buf.push(client_id);
        buf.push(kind.to_byte(service));
        if is_control(service) {
            buf.push(transaction_id as u8);
        } else {
            buf.extend_from_slice(&transaction_id.to_le_bytes());
        }
        buf.extend_from_slice(&message_id.to_le_bytes());
        buf.extend_from_slice(&[0, 0]);
        let mut builder = Self {
            buf,
            capacity: MAX_FRAME_LEN,
        };
        builder.sync_lengths();
        builder
    }

    /// Lowers the capacity limit; it never exceeds [`MAX_FRAME_LEN`].
    #[cfg(test)]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.min(MAX_FRAME_LEN);
        self
    }

    /// Appends a TLV record.
    pub fn add_tlv(&mut self, tlv_type: u8, value: &[u8]) -> Result<&mut Self, FrameError> {
        let new_len = self.buf.len() + TLV_HEADER_LEN + value.len();
        if new_len > self.capacity || value.len() > usize::from(u16::MAX) {
            return Err(FrameError::BufferFull {
                capacity: self.capacity,
            });
        }
        self.buf.push(tlv_type);
        self.buf
            .extend_from_slice(&(value.len() as u16).to_le_bytes());
        self.buf.extend_from_slice(value);
        self.sync_lengths();
        Ok(self)
    }

    /// Appends a successful result TLV.
    pub fn add_success(&mut self) -> Result<&mut Self, FrameError> {
        self.add_tlv(TLV_RESULT, &[0, 0, 0, 0])
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    fn sync_lengths(&mut self) {
        let qmux_len = (self.buf.len() - 1) as u16;
        self.buf[1..3].copy_from_slice(&qmux_len.to_le_bytes());
        let service = self.buf[4];
        let tlv_start = QMUX_HEADER_LEN + qmi_header_len(service);
        let qmi_len = (self.buf.len() - tlv_start) as u16;
        self.buf[tlv_start - 2..tlv_start].copy_from_slice(&qmi_len.to_le_bytes());
    }
}

/// Builds a response to `request`, echoing its service, client and transaction id.
pub fn response_to(request: &Header) -> FrameBuilder {
    build_header(
        QmuxFlags::SERVICE,
        request.service,
        request.client_id,
        MessageKind::Response,
        request.transaction_id,
        request.message_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn voice_frame() -> Vec<u8> {
        let mut builder = build_header(QmuxFlags::empty(), 0x09, 3, MessageKind::Request, 0x1234, 0x0020);
        builder.add_tlv(0x01, b"+123456").unwrap();
        builder.add_tlv(0x10, &[0x07]).unwrap();
        builder.finish()
    }

    #[test]
    fn header_round_trips_ids() {
        let frame = voice_frame();
        let header = parse_header(&frame).unwrap();
        assert_eq!(header.service, 0x09);
        assert_eq!(header.client_id, 3);
        assert_eq!(header.transaction_id, 0x1234);
        assert_eq!(header.message_id, 0x0020);
        assert_eq!(header.kind(), Some(MessageKind::Request));
        assert_eq!(usize::from(header.qmux_len) + 1, frame.len());
        assert_eq!(header.payload_end(), frame.len());
    }

    #[test]
    fn control_frames_use_short_transaction_ids() {
        let mut builder = build_header(QmuxFlags::SERVICE, 0x00, 0, MessageKind::Response, 0x42, 0x0022);
        builder.add_success().unwrap();
        builder.add_tlv(0x01, &[0x09, 0x02]).unwrap();
        let frame = builder.finish();
        assert_eq!(frame[6], 0x01);
        let header = parse_header(&frame).unwrap();
        assert_eq!(header.tlv_start(), CTL_HEADER_LEN + QMUX_HEADER_LEN);
        assert_eq!(header.transaction_id, 0x42);
        assert_eq!(header.kind(), Some(MessageKind::Response));
        assert_eq!(tlv_value(&frame, 0x01), Some(&[0x09, 0x02][..]));
        assert!(result_ok(&frame));
    }

    #[test]
    fn short_and_truncated_frames_are_rejected() {
        assert!(matches!(parse_header(&[0x01, 0x10]), Err(FrameError::TooShort { .. })));
        let frame = voice_frame();
        assert!(matches!(
            parse_header(&frame[..frame.len() - 1]),
            Err(FrameError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn qmi_length_may_not_overrun_qmux_length() {
        let mut frame = voice_frame();
        let tlv_start = QMUX_HEADER_LEN + QMI_HEADER_LEN;
        frame[tlv_start - 2] = 0xFF;
        assert!(matches!(parse_header(&frame), Err(FrameError::LengthMismatch { .. })));
    }

    #[test]
    fn find_tlv_scans_unordered_records() {
        let frame = voice_frame();
        assert_eq!(find_tlv(&frame, 0x01), Some(13));
        assert_eq!(find_tlv(&frame, 0x10), Some(13 + 3 + 7));
        assert_eq!(tlv_value(&frame, 0x10), Some(&[0x07][..]));
        assert_eq!(find_tlv(&frame, 0x11), None);
    }

    #[test]
    fn find_tlv_stops_at_overlong_record() {
        let mut frame = voice_frame();
        // Claim the first record is longer than the payload.
        frame[14] = 0x40;
        assert_eq!(find_tlv(&frame, 0x10), None);
    }

    #[test]
    fn add_tlv_respects_capacity() {
        let mut builder = build_header(QmuxFlags::empty(), 0x05, 1, MessageKind::Request, 1, 0x20)
            .with_capacity(20);
        builder.add_tlv(0x01, &[0; 4]).unwrap();
        let before = builder.len();
        assert_eq!(
            builder.add_tlv(0x02, &[0; 4]).unwrap_err(),
            FrameError::BufferFull { capacity: 20 }
        );
        assert_eq!(builder.len(), before);
    }

    proptest! {
        #[test]
        fn find_tlv_is_bounded_on_arbitrary_input(bytes in proptest::collection::vec(any::<u8>(), 0..256), id in any::<u8>()) {
            let first = find_tlv(&bytes, id);
            prop_assert_eq!(first, find_tlv(&bytes, id));
            if let Some(offset) = first {
                let header = parse_header(&bytes).unwrap();
                let len = usize::from(u16::from_le_bytes([bytes[offset + 1], bytes[offset + 2]]));
                prop_assert!(offset + TLV_HEADER_LEN + len <= header.payload_end());
                prop_assert!(offset + TLV_HEADER_LEN + len <= bytes.len());
                prop_assert_eq!(bytes[offset], id);
            }
        }

        #[test]
        fn built_headers_round_trip(service in 1u8.., client in any::<u8>(), txn in any::<u16>(), msg in any::<u16>()) {
            let frame = build_header(QmuxFlags::SERVICE, service, client, MessageKind::Indication, txn, msg).finish();
            let header = parse_header(&frame).unwrap();
            prop_assert_eq!(header.service, service);
            prop_assert_eq!(header.client_id, client);
            prop_assert_eq!(header.transaction_id, txn);
            prop_assert_eq!(header.message_id, msg);
            prop_assert_eq!(header.kind(), Some(MessageKind::Indication));
        }
    }
}
