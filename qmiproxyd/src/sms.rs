// src/sms.rs

//! Fabricated incoming SMS and interception of SMS sent to the daemon.
//!
//! Injection is a four-step exchange with the host's WMS client:
//!
//! ```text
//!   daemon                                   host
//!     | --- event report (new message) ------> |
//!     | <------------------ raw read request - |
//!     | --- raw read response (PDU) ---------> |
//!     | <----------------- modify tag request - |
//!     | --- modify tag response -------------> |
//!     | <--------------------- delete request - |
//!     | --- delete response -----------------> |
//! ```
//!
//! Each response echoes the transaction id of the request it answers. A step
//! that is not answered in time abandons the whole exchange. Host frames that
//! arrive mid-exchange are held back for the proxy loop to dispatch afterwards.

use chrono::{DateTime, Datelike, FixedOffset};
use log::{debug, info, warn};
use std::time::{Duration, Instant};

use crate::constants::{QmuxFlags, Service, WmsMessage};
use crate::error::{ProxyError, Result};
use crate::pdu::{self, digits_of};
use crate::qmi::{self, FrameError, Header, MessageKind};
use crate::transport::Endpoint;

/// Raw send request: format, length, PDU. Raw read response: tag, format, length, PDU.
const TLV_RAW_MESSAGE: u8 = 0x01;
/// Event report: storage type and index of the new message.
const TLV_MT_MESSAGE: u8 = 0x10;
/// Event report: message mode.
const TLV_MESSAGE_MODE: u8 = 0x12;
/// Raw send response: message id assigned by the network.
const TLV_MESSAGE_ID: u8 = 0x01;

const STORAGE_NV: u8 = 0x01;
const MODE_GW: u8 = 0x01;
const FORMAT_GW_PP: u8 = 0x06;
const TAG_MT_NOT_READ: u8 = 0x01;

/// Clocks reporting an earlier year have not been set from the network yet.
const FIRST_PLAUSIBLE_YEAR: i32 = 2023;

/// Who asked for an injection, and so who answers for its outcome.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum SmsSource {
    /// A chat reply. Delivery is best effort and never fails the command
    /// that produced it.
    Internal,
    /// A scheduled message. A failed delivery fails the task.
    External,
}

/// The injection currently in flight.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct PendingSms {
    pub index: u32,
    pub cursor: u16,
    pub source: SmsSource,
}

/// An outgoing message the daemon captured for itself.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct Intercepted {
    /// Response to send back to the host right away.
    pub ack: Vec<u8>,
    pub text: String,
}

#[derive(Debug)]
pub struct SmsEngine {
    sender: String,
    reserved_digits: String,
    transaction_id: u16,
    next_index: u32,
    message_id: u16,
    pending: Option<PendingSms>,
    deferred: Vec<Vec<u8>>,
}

impl SmsEngine {
    pub fn new(reserved_number: &str) -> Self {
        Self {
            sender: reserved_number.to_string(),
            reserved_digits: digits_of(reserved_number.as_bytes()),
            transaction_id: 0,
            next_index: 0,
            message_id: 0,
            pending: None,
            deferred: Vec::new(),
        }
    }

    pub fn pending(&self) -> Option<PendingSms> {
        self.pending
    }

    /// Host frames received during the last injection that were not part of it, in arrival order.
    pub fn take_deferred(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.deferred)
    }

    fn next_transaction(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }

    /// Captures a raw send addressed to the reserved number.
    ///
    /// Every other frame, including messages to other numbers, yields
    /// `Ok(None)` and must be relayed untouched.
    pub fn handle_outgoing_sms(&mut self, frame: &[u8]) -> Result<Option<Intercepted>> {
        let Some((header, submit)) = self.addressed_to_us(frame) else {
            return Ok(None);
        };
        self.message_id = self.message_id.wrapping_add(1);
        let mut builder = qmi::response_to(&header);
        builder
            .add_success()?
            .add_tlv(TLV_MESSAGE_ID, &self.message_id.to_le_bytes())?;
        debug!("Captured message for the reserved number: {:?}", submit.text);
        Ok(Some(Intercepted {
            ack: builder.finish(),
            text: submit.text,
        }))
    }

    fn addressed_to_us(&self, frame: &[u8]) -> Option<(Header, pdu::Submit)> {
        let header = qmi::parse_header(frame).ok()?;
        if header.service() != Some(Service::Wms)
            || header.kind() != Some(MessageKind::Request)
            || WmsMessage::try_from(header.message_id).ok()? != WmsMessage::RawSend
        {
            return None;
        }
        let raw = qmi::tlv_value(frame, TLV_RAW_MESSAGE)?;
        let len = usize::from(u16::from_le_bytes([*raw.get(1)?, *raw.get(2)?]));
        let submit = pdu::parse_submit(raw.get(3..3 + len)?)?;
        (submit.destination == self.reserved_digits).then_some((header, submit))
    }

    /// Delivers `text` to the host as an incoming SMS from the reserved number.
    ///
    /// Host frames that arrive while waiting and are not part of the exchange
    /// are kept for [`SmsEngine::take_deferred`], whatever the outcome.
    pub fn inject(
        &mut self,
        host: &Endpoint,
        client_id: u8,
        text: &str,
        source: SmsSource,
        step_timeout: Duration,
        now: DateTime<FixedOffset>,
    ) -> Result<()> {
        let index = self.next_index;
        self.next_index = self.next_index.wrapping_add(1);
        let cursor = self.next_transaction();
        self.pending = Some(PendingSms { index, cursor, source });

        let result = self.handshake(host, client_id, text, step_timeout, now);
        match &result {
            Ok(()) => info!("Delivered {:?} message #{} to host", source, index),
            Err(e) => warn!("Abandoned {:?} message #{}: {}", source, index, e),
        }
        self.pending = None;
        result
    }

    fn handshake(
        &mut self,
        host: &Endpoint,
        client_id: u8,
        text: &str,
        step_timeout: Duration,
        now: DateTime<FixedOffset>,
    ) -> Result<()> {
        let Some(PendingSms { index, cursor, .. }) = self.pending else {
            return Ok(());
        };
        host.send(&event_report(client_id, cursor, index)?)?;

        let read = self.await_request(host, WmsMessage::RawRead, "raw read request", step_timeout)?;
        self.advance(read.transaction_id);
        let when = if now.year() < FIRST_PLAUSIBLE_YEAR {
            pdu::placeholder_timestamp()
        } else {
            now
        };
        host.send(&raw_read_response(&read, &pdu::build_deliver(&self.sender, text, &when))?)?;

        let tag = self.await_request(host, WmsMessage::ModifyTag, "modify tag request", step_timeout)?;
        self.advance(tag.transaction_id);
        host.send(&empty_response(&tag)?)?;

        let delete = self.await_request(host, WmsMessage::Delete, "delete request", step_timeout)?;
        self.advance(delete.transaction_id);
        host.send(&empty_response(&delete)?)?;
        Ok(())
    }

    /// Waits for the host's next `expected` request, holding back anything else.
    fn await_request(
        &mut self,
        host: &Endpoint,
        expected: WmsMessage,
        step: &'static str,
        timeout: Duration,
    ) -> Result<Header> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProxyError::HandshakeTimeout(step));
            }
            let Some(frame) = host.recv(remaining)? else {
                return Err(ProxyError::HandshakeTimeout(step));
            };
            match qmi::parse_header(&frame) {
                Ok(header)
                    if header.service() == Some(Service::Wms)
                        && header.kind() == Some(MessageKind::Request)
                        && header.message_id == u16::from(expected) =>
                {
                    return Ok(header);
                }
                _ => self.deferred.push(frame),
            }
        }
    }

    /// Moves the cursor to the transaction id the host just used.
    fn advance(&mut self, transaction_id: u16) {
        if let Some(pending) = self.pending.as_mut() {
            pending.cursor = transaction_id;
        }
        self.transaction_id = transaction_id;
    }
}

fn event_report(client_id: u8, transaction_id: u16, index: u32) -> Result<Vec<u8>, FrameError> {
    let mut builder = qmi::build_header(
        QmuxFlags::SERVICE,
        Service::Wms.into(),
        client_id,
        MessageKind::Indication,
        transaction_id,
        WmsMessage::EventReport.into(),
    );
    let mut mt = vec![STORAGE_NV];
    mt.extend_from_slice(&index.to_le_bytes());
    builder
        .add_tlv(TLV_MT_MESSAGE, &mt)?
        .add_tlv(TLV_MESSAGE_MODE, &[MODE_GW])?;
    Ok(builder.finish())
}

fn raw_read_response(request: &Header, tpdu: &[u8]) -> Result<Vec<u8>> {
    let mut value = vec![TAG_MT_NOT_READ, FORMAT_GW_PP];
    value.extend_from_slice(&(tpdu.len() as u16).to_le_bytes());
    value.extend_from_slice(tpdu);
    let mut builder = qmi::response_to(request);
    builder.add_success()?;
    builder.add_tlv(TLV_RAW_MESSAGE, &value)?;
    Ok(builder.finish())
}

fn empty_response(request: &Header) -> Result<Vec<u8>, FrameError> {
    let mut builder = qmi::response_to(request);
    builder.add_success()?;
    Ok(builder.finish())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn host_request(message: WmsMessage, transaction_id: u16) -> Vec<u8> {
        let mut builder = qmi::build_header(
            QmuxFlags::empty(),
            Service::Wms.into(),
            3,
            MessageKind::Request,
            transaction_id,
            message.into(),
        );
        builder.add_tlv(0x01, &[STORAGE_NV, 0, 0, 0, 0]).unwrap();
        builder.finish()
    }

    pub fn raw_send(transaction_id: u16, destination: &str, text: &str) -> Vec<u8> {
        let tpdu = pdu::submit_pdu(destination, text);
        let mut value = vec![FORMAT_GW_PP];
        value.extend_from_slice(&(tpdu.len() as u16).to_le_bytes());
        value.extend_from_slice(&tpdu);
        let mut builder = qmi::build_header(
            QmuxFlags::empty(),
            Service::Wms.into(),
            3,
            MessageKind::Request,
            transaction_id,
            WmsMessage::RawSend.into(),
        );
        builder.add_tlv(TLV_RAW_MESSAGE, &value).unwrap();
        builder.finish()
    }

    /// Decodes the text of a raw read response.
    pub fn delivered_text(frame: &[u8]) -> String {
        let value = qmi::tlv_value(frame, TLV_RAW_MESSAGE).unwrap();
        let tpdu = &value[4..];
        // smsc, first octet, address length
        let digits = usize::from(tpdu[2]);
        let udl_at = 2 + 2 + digits.div_ceil(2) + 2 + 7;
        let septets = pdu::unpack_gsm7(&tpdu[udl_at + 1..], usize::from(tpdu[udl_at]));
        String::from_utf8(septets).unwrap()
    }
}
