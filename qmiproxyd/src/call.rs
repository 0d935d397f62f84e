// src/call.rs

//! The simulated call state machine.
//!
//! The baseband never sees a simulated call, so every status transition a real
//! call would produce has to be synthesized here. The engine only decides: it
//! returns the frames to send and the audio change to make, and the proxy loop
//! performs the I/O.
//!
//! ```text
//!   Idle --dial reserved--> Alerting --> Established --end--> Disconnecting --> Idle
//!   Idle --call-back------> Ringing(incoming) --answer--> Established
//! ```

use log::{debug, info, warn};

use crate::constants::{CallMode, CallStatus, QmuxFlags, Service, VoiceMessage};
use crate::error::{ProxyError, Side};
use crate::pdu::digits_of;
use crate::peripherals::AudioProfile;
use crate::proxy::Verdict;
use crate::qmi::{self, FrameError, Header, MessageKind};

/// Call id used for the simulated call; real calls are numbered from 1 upwards.
pub const SIMULATED_CALL_ID: u8 = 0x7E;

/// Dial request: the calling number.
const TLV_DIAL_NUMBER: u8 = 0x01;
/// Answer/end requests: the call id.
const TLV_CALL_ID_REQ: u8 = 0x01;
/// Responses: the call id.
const TLV_CALL_ID_RESP: u8 = 0x10;
/// Status indication: call information, one record per call.
const TLV_CALL_INFO: u8 = 0x01;
/// Status indication: remote party numbers.
const TLV_REMOTE_NUMBER: u8 = 0x10;
/// Bytes per call information record.
const CALL_INFO_LEN: usize = 7;

const CALL_TYPE_VOICE: u8 = 0x00;

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Direction {
    None,
    Outgoing,
    Incoming,
}

impl Direction {
    fn wire(self) -> u8 {
        match self {
            Direction::Outgoing => 0x01,
            Direction::Incoming => 0x02,
            Direction::None => 0x00,
        }
    }
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum CallState {
    Idle,
    Ringing(Direction),
    Alerting,
    Established,
    Disconnecting,
}

/// A change the audio collaborator should make.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum AudioCue {
    Start(AudioProfile),
    Stop,
}

/// What to do with a voice-service frame.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct CallOutcome {
    pub verdict: Verdict,
    pub audio: Option<AudioCue>,
}

impl CallOutcome {
    fn relay() -> Self {
        Self {
            verdict: Verdict::Relay,
            audio: None,
        }
    }
}

/// The single simulated call session, plus what is known about real calls.
#[derive(Debug)]
pub struct CallEngine {
    reserved: String,
    active: bool,
    direction: Direction,
    state: CallState,
    transaction_id: u16,
    client_id: u8,
    real_call_audio: bool,
}

impl CallEngine {
    pub fn new(reserved_number: &str) -> Self {
        Self {
            reserved: digits_of(reserved_number.as_bytes()),
            active: false,
            direction: Direction::None,
            state: CallState::Idle,
            transaction_id: 0,
            client_id: qmi::BROADCAST_CLIENT,
            real_call_audio: false,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn is_simulating(&self) -> bool {
        self.active
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn is_reserved(&self, number: &[u8]) -> bool {
        !self.reserved.is_empty() && digits_of(number) == self.reserved
    }

    fn next_transaction(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }

    /// Decides what to do with a voice-service frame travelling from `source`.
    pub fn handle_call_packet(&mut self, frame: &[u8], source: Side) -> CallOutcome {
        let Ok(header) = qmi::parse_header(frame) else {
            return CallOutcome::relay();
        };
        let Ok(message) = VoiceMessage::try_from(header.message_id) else {
            return CallOutcome::relay();
        };
        let decided = match (source, header.kind(), message) {
            (Side::Host, Some(MessageKind::Request), VoiceMessage::DialCall) => self.on_dial(&header, frame),
            (Side::Host, Some(MessageKind::Request), VoiceMessage::AnswerCall) => self.on_answer(&header, frame),
            (Side::Host, Some(MessageKind::Request), VoiceMessage::EndCall) => self.on_end(&header, frame),
            (Side::Dsp, Some(MessageKind::Indication), VoiceMessage::AllCallStatusInd) => {
                Ok(self.observe_real_calls(frame))
            }
            _ => Ok(CallOutcome::relay()),
        };
        decided.unwrap_or_else(|e| {
            // The request concerned the simulated call, so it must not reach the network.
            warn!("Dropping simulated call after a frame error: {}", e);
            self.reset();
            CallOutcome {
                verdict: Verdict::Discard,
                audio: Some(AudioCue::Stop),
            }
        })
    }

    fn on_dial(&mut self, header: &Header, frame: &[u8]) -> Result<CallOutcome, FrameError> {
        let Some(number) = qmi::tlv_value(frame, TLV_DIAL_NUMBER) else {
            return Ok(CallOutcome::relay());
        };
        if !self.is_reserved(number) {
            return Ok(CallOutcome::relay());
        }
        if self.active {
            debug!("Dial to the reserved number while already simulating; ignoring");
            return Ok(CallOutcome {
                verdict: Verdict::Discard,
                audio: None,
            });
        }

        info!("Simulating outgoing call to the reserved number");
        self.active = true;
        self.direction = Direction::Outgoing;
        self.client_id = header.client_id;
        self.state = CallState::Alerting;
        let ack = call_id_response(header)?;
        let alerting = self.status_indication(CallStatus::Alerting)?;
        self.state = CallState::Established;
        let established = self.status_indication(CallStatus::Conversation)?;
        Ok(CallOutcome {
            verdict: Verdict::Respond(vec![ack, alerting, established]),
            audio: Some(AudioCue::Start(AudioProfile::CircuitSwitched)),
        })
    }

    fn on_answer(&mut self, header: &Header, frame: &[u8]) -> Result<CallOutcome, FrameError> {
        if !self.targets_simulated_call(frame) || self.state != CallState::Ringing(Direction::Incoming) {
            return Ok(CallOutcome::relay());
        }
        info!("Host answered the simulated call");
        self.state = CallState::Established;
        let ack = call_id_response(header)?;
        let established = self.status_indication(CallStatus::Conversation)?;
        Ok(CallOutcome {
            verdict: Verdict::Respond(vec![ack, established]),
            audio: Some(AudioCue::Start(AudioProfile::CircuitSwitched)),
        })
    }

    fn on_end(&mut self, header: &Header, frame: &[u8]) -> Result<CallOutcome, FrameError> {
        if !self.active || !self.targets_simulated_call(frame) {
            return Ok(CallOutcome::relay());
        }
        info!("Ending simulated call from state {:?}", self.state);
        self.state = CallState::Disconnecting;
        let ack = call_id_response(header)?;
        let ended = self.status_indication(CallStatus::End)?;
        self.reset();
        Ok(CallOutcome {
            verdict: Verdict::Respond(vec![ack, ended]),
            audio: Some(AudioCue::Stop),
        })
    }

    fn targets_simulated_call(&self, frame: &[u8]) -> bool {
        qmi::tlv_value(frame, TLV_CALL_ID_REQ).and_then(|v| v.first().copied()) == Some(SIMULATED_CALL_ID)
    }

    fn reset(&mut self) {
        self.active = false;
        self.direction = Direction::None;
        self.state = CallState::Idle;
        self.client_id = qmi::BROADCAST_CLIENT;
    }

    /// Starts an admin call-back: the host sees the reserved number ringing.
    ///
    /// Fails with `CallInProgress` while another simulated call is up.
    pub fn start_incoming(&mut self, client_id: u8) -> Result<Vec<u8>, ProxyError> {
        if self.active {
            return Err(ProxyError::CallInProgress);
        }
        info!("Ringing the host from the reserved number");
        self.active = true;
        self.direction = Direction::Incoming;
        self.client_id = client_id;
        self.state = CallState::Ringing(Direction::Incoming);
        let ring = self.status_indication(CallStatus::Incoming).inspect_err(|_| self.reset())?;
        Ok(ring)
    }

    /// Follows real calls reported by the baseband so audio can be routed for them.
    fn observe_real_calls(&mut self, frame: &[u8]) -> CallOutcome {
        let Some(info) = qmi::tlv_value(frame, TLV_CALL_INFO) else {
            return CallOutcome::relay();
        };
        if let Some(remote) = qmi::tlv_value(frame, TLV_REMOTE_NUMBER) {
            // count, call id, presentation, length, digits
            if remote.len() > 4 && self.is_reserved(&remote[4..]) {
                return CallOutcome::relay();
            }
        }

        let count = usize::from(*info.first().unwrap_or(&0));
        let records = info.get(1..).unwrap_or(&[]);
        let mut live_mode = None;
        for record in records.chunks_exact(CALL_INFO_LEN).take(count) {
            let status = CallStatus::try_from(record[1]).ok();
            let live = matches!(
                status,
                Some(
                    CallStatus::Origination
                        | CallStatus::Alerting
                        | CallStatus::Conversation
                        | CallStatus::CcInProgress
                        | CallStatus::Hold
                )
            );
            if live {
                live_mode = Some(CallMode::try_from(record[4]).unwrap_or(CallMode::Unknown));
            }
        }

        let audio = match (live_mode, self.real_call_audio) {
            (Some(mode), false) => {
                self.real_call_audio = true;
                Some(AudioCue::Start(AudioProfile::for_mode(mode)))
            }
            (None, true) => {
                self.real_call_audio = false;
                Some(AudioCue::Stop)
            }
            _ => None,
        };
        CallOutcome {
            verdict: Verdict::Relay,
            audio,
        }
    }

    fn status_indication(&mut self, status: CallStatus) -> Result<Vec<u8>, FrameError> {
        let transaction_id = self.next_transaction();
        let mut builder = qmi::build_header(
            QmuxFlags::SERVICE,
            Service::Voice.into(),
            self.client_id,
            MessageKind::Indication,
            transaction_id,
            VoiceMessage::AllCallStatusInd.into(),
        );
        let info = [
            1,
            SIMULATED_CALL_ID,
            status.into(),
            CALL_TYPE_VOICE,
            self.direction.wire(),
            CallMode::Umts.into(),
            0, // multiparty
            0, // alternate line
        ];
        let mut remote = vec![1, SIMULATED_CALL_ID, 0, self.reserved.len() as u8];
        remote.extend_from_slice(self.reserved.as_bytes());
        builder.add_tlv(TLV_CALL_INFO, &info)?;
        builder.add_tlv(TLV_REMOTE_NUMBER, &remote)?;
        Ok(builder.finish())
    }
}

fn call_id_response(request: &Header) -> Result<Vec<u8>, FrameError> {
    let mut builder = qmi::response_to(request);
    builder.add_success()?.add_tlv(TLV_CALL_ID_RESP, &[SIMULATED_CALL_ID])?;
    Ok(builder.finish())
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    const RESERVED: &str = "+223344556677";

    fn responses(outcome: &CallOutcome) -> &[Vec<u8>] {
        match &outcome.verdict {
            Verdict::Respond(frames) => frames,
            other => panic!("expected synthesized frames, got {:?}", other),
        }
    }

    #[test]
    fn dial_to_reserved_number_yields_ack_alerting_established() {
        let mut engine = CallEngine::new(RESERVED);
        let outcome = engine.handle_call_packet(&dial(0x31, RESERVED), Side::Host);
        let frames = responses(&outcome);
        assert_eq!(frames.len(), 3);

        let ack = qmi::parse_header(&frames[0]).unwrap();
        assert_eq!(ack.kind(), Some(MessageKind::Response));
        assert_eq!(ack.transaction_id, 0x31);
        assert_eq!(ack.client_id, 2);
        assert!(qmi::result_ok(&frames[0]));
        assert_eq!(status_of(&frames[1]), CallStatus::Alerting);
        assert_eq!(status_of(&frames[2]), CallStatus::Conversation);

        assert_eq!(engine.state(), CallState::Established);
        assert_eq!(engine.direction(), Direction::Outgoing);
        assert_eq!(outcome.audio, Some(AudioCue::Start(AudioProfile::CircuitSwitched)));
    }

    #[test]
    fn dial_to_any_other_number_passes_through() {
        let mut engine = CallEngine::new(RESERVED);
        let outcome = engine.handle_call_packet(&dial(1, "+15551234567"), Side::Host);
        assert_eq!(outcome, CallOutcome::relay());
        assert_eq!(engine.state(), CallState::Idle);
    }

    #[test]
    fn hangup_returns_to_idle() {
        let mut engine = CallEngine::new(RESERVED);
        engine.handle_call_packet(&dial(1, RESERVED), Side::Host);
        let end = request(VoiceMessage::EndCall, 2, TLV_CALL_ID_REQ, &[SIMULATED_CALL_ID]);
        let outcome = engine.handle_call_packet(&end, Side::Host);
        let frames = responses(&outcome);
        assert_eq!(frames.len(), 2);
        assert_eq!(qmi::parse_header(&frames[0]).unwrap().transaction_id, 2);
        assert_eq!(status_of(&frames[1]), CallStatus::End);
        assert_eq!(engine.state(), CallState::Idle);
        assert!(!engine.is_simulating());
        assert_eq!(outcome.audio, Some(AudioCue::Stop));
    }

    #[test]
    fn ending_a_real_call_is_left_alone() {
        let mut engine = CallEngine::new(RESERVED);
        engine.handle_call_packet(&dial(1, RESERVED), Side::Host);
        let end = request(VoiceMessage::EndCall, 2, TLV_CALL_ID_REQ, &[1]);
        assert_eq!(engine.handle_call_packet(&end, Side::Host), CallOutcome::relay());
        assert_eq!(engine.state(), CallState::Established);
    }

    #[test]
    fn call_back_rings_until_answered() {
        let mut engine = CallEngine::new(RESERVED);
        let ring = engine.start_incoming(4).unwrap();
        assert_eq!(status_of(&ring), CallStatus::Incoming);
        assert_eq!(qmi::parse_header(&ring).unwrap().client_id, 4);
        assert_eq!(engine.state(), CallState::Ringing(Direction::Incoming));
        assert!(matches!(engine.start_incoming(4), Err(ProxyError::CallInProgress)));

        let answer = request(VoiceMessage::AnswerCall, 9, TLV_CALL_ID_REQ, &[SIMULATED_CALL_ID]);
        let outcome = engine.handle_call_packet(&answer, Side::Host);
        let frames = responses(&outcome);
        assert_eq!(frames.len(), 2);
        assert_eq!(status_of(&frames[1]), CallStatus::Conversation);
        assert_eq!(engine.state(), CallState::Established);
    }

    #[test]
    fn indication_transaction_ids_increase() {
        let mut engine = CallEngine::new(RESERVED);
        let outcome = engine.handle_call_packet(&dial(1, RESERVED), Side::Host);
        let frames = responses(&outcome);
        let alerting = qmi::parse_header(&frames[1]).unwrap().transaction_id;
        let established = qmi::parse_header(&frames[2]).unwrap().transaction_id;
        assert_eq!(established, alerting + 1);
    }

    fn real_status(status: CallStatus, mode: CallMode, number: &str) -> Vec<u8> {
        let mut builder = qmi::build_header(
            QmuxFlags::SERVICE,
            Service::Voice.into(),
            qmi::BROADCAST_CLIENT,
            MessageKind::Indication,
            7,
            VoiceMessage::AllCallStatusInd.into(),
        );
        builder
            .add_tlv(TLV_CALL_INFO, &[1, 1, status.into(), 0, 1, mode.into(), 0, 0])
            .unwrap();
        let mut remote = vec![1, 1, 0, number.len() as u8];
        remote.extend_from_slice(number.as_bytes());
        builder.add_tlv(TLV_REMOTE_NUMBER, &remote).unwrap();
        builder.finish()
    }

    #[test]
    fn real_calls_drive_audio_and_pass_through() {
        let mut engine = CallEngine::new(RESERVED);
        let outcome = engine.handle_call_packet(&real_status(CallStatus::Conversation, CallMode::Lte, "5551234"), Side::Dsp);
        assert_eq!(outcome.verdict, Verdict::Relay);
        assert_eq!(outcome.audio, Some(AudioCue::Start(AudioProfile::VoLte)));

        let outcome = engine.handle_call_packet(&real_status(CallStatus::Conversation, CallMode::Lte, "5551234"), Side::Dsp);
        assert_eq!(outcome.audio, None);

        let outcome = engine.handle_call_packet(&real_status(CallStatus::End, CallMode::Lte, "5551234"), Side::Dsp);
        assert_eq!(outcome.audio, Some(AudioCue::Stop));
        assert_eq!(engine.state(), CallState::Idle);
    }

    #[test]
    fn status_for_reserved_number_is_ignored() {
        let mut engine = CallEngine::new(RESERVED);
        let outcome = engine.handle_call_packet(&real_status(CallStatus::Conversation, CallMode::Gsm, "223344556677"), Side::Dsp);
        assert_eq!(outcome, CallOutcome::relay());
    }
}
