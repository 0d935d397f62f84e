// src/tracker.rs

//! Watches control-service traffic to infer which QMI clients the host holds.
//!
//! The protocol has no way to list live clients, so the tracker mirrors the
//! table from the get/release client id exchanges it sees. When the host keeps
//! requesting clients while several are already registered, it has usually
//! lost track of them (USB suspend/resume), and the only way back is to release
//! every possible client and bounce the link.

use log::{debug, info, warn};
use std::time::{Duration, Instant, SystemTime};

use crate::constants::{ControlMessage, MAX_CLIENTS, QmuxFlags, SWEEP_MAX_INSTANCE, Service};
use crate::error::{ProxyError, Side};
use crate::qmi::{self, FrameError, Header, MessageKind};

/// Marker TLV holding the service id, followed by the instance id where known.
const TLV_CLIENT: u8 = 0x01;
/// Registration attempts remembered, most recent last.
const MAX_ATTEMPTS: usize = 8;

/// Progress of one registration attempt.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum RegistrationState {
    Idle,
    Requested,
    Confirmed,
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct Client {
    pub service: u8,
    pub instance: u8,
}

/// One host request for a client id and how far it got.
#[derive(Debug, Copy, Clone)]
struct Attempt {
    transaction_id: u16,
    service: u8,
    state: RegistrationState,
}

/// Mirror of the host's registered QMI clients.
#[derive(Debug)]
pub struct ClientTracker {
    clients: Vec<Client>,
    attempts: Vec<Attempt>,
    threshold: usize,
    last_registration: Option<SystemTime>,
    sweep_transaction: u8,
    resets: u32,
}

/// A control-service client event decoded from a frame.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
enum Event {
    RegisterRequest { service: u8 },
    RegisterConfirm(Client),
    RegisterRefused,
    ReleaseConfirm(Client),
}

fn decode_event(header: &Header, frame: &[u8]) -> Option<Event> {
    let message = ControlMessage::try_from(header.message_id).ok()?;
    let client = || {
        let value = qmi::tlv_value(frame, TLV_CLIENT)?;
        Some(Client {
            service: *value.first()?,
            instance: *value.get(1)?,
        })
    };
    match (message, header.kind()?) {
        (ControlMessage::GetClientId, MessageKind::Request) => Some(Event::RegisterRequest {
            service: *qmi::tlv_value(frame, TLV_CLIENT)?.first()?,
        }),
        (ControlMessage::GetClientId, MessageKind::Response) if qmi::result_ok(frame) => {
            client().map(Event::RegisterConfirm)
        }
        (ControlMessage::GetClientId, MessageKind::Response) => Some(Event::RegisterRefused),
        (ControlMessage::ReleaseClientId, MessageKind::Response) if qmi::result_ok(frame) => {
            client().map(Event::ReleaseConfirm)
        }
        _ => None,
    }
}

impl ClientTracker {
    pub fn new(threshold: usize) -> Self {
        Self {
            clients: Vec::with_capacity(MAX_CLIENTS),
            attempts: Vec::with_capacity(MAX_ATTEMPTS),
            threshold,
            last_registration: None,
            sweep_transaction: 0,
            resets: 0,
        }
    }

    pub fn active_count(&self) -> usize {
        self.clients.len()
    }

    pub fn instances_of(&self, service: u8) -> usize {
        self.clients.iter().filter(|c| c.service == service).count()
    }

    /// The first instance registered for `service`, if any.
    pub fn client_for(&self, service: Service) -> Option<u8> {
        let service = u8::from(service);
        self.clients
            .iter()
            .find(|c| c.service == service)
            .map(|c| c.instance)
    }

    /// State of the most recent registration attempt.
    pub fn state(&self) -> RegistrationState {
        self.attempts.last().map_or(RegistrationState::Idle, |a| a.state)
    }

    /// State of the attempt started by the host request with `transaction_id`.
    pub fn attempt(&self, transaction_id: u16) -> RegistrationState {
        self.attempts
            .iter()
            .rev()
            .find(|a| a.transaction_id == transaction_id)
            .map_or(RegistrationState::Idle, |a| a.state)
    }

    fn attempt_mut(&mut self, transaction_id: u16) -> Option<&mut Attempt> {
        self.attempts
            .iter_mut()
            .rev()
            .find(|a| a.transaction_id == transaction_id && a.state == RegistrationState::Requested)
    }

    pub fn last_registration(&self) -> Option<SystemTime> {
        self.last_registration
    }

    pub fn resets(&self) -> u32 {
        self.resets
    }

    /// Observes a control-service frame from `source`.
    ///
    /// Returns `true` when the frame must not reach its peer and the caller
    /// must run the hard reset.
    pub fn track_registration(&mut self, frame: &[u8], source: Side) -> bool {
        let Ok(header) = qmi::parse_header(frame) else {
            return false;
        };
        if header.service() != Some(Service::Control) {
            return false;
        }
        let Some(event) = decode_event(&header, frame) else {
            return false;
        };

        match (source, event) {
            (Side::Host, Event::RegisterRequest { service }) => {
                let live = self.active_count();
                if live > self.threshold {
                    warn!(
                        "Host requested a client for service {:#04x} with {} clients still registered",
                        service, live
                    );
                    return true;
                }
                if self.attempts.len() == MAX_ATTEMPTS {
                    self.attempts.remove(0);
                }
                self.attempts.push(Attempt {
                    transaction_id: header.transaction_id,
                    service,
                    state: RegistrationState::Requested,
                });
                false
            }
            (Side::Dsp, Event::RegisterConfirm(client)) => {
                let cut = match self.insert(client) {
                    Ok(()) => false,
                    Err(e) => {
                        warn!("{}", e);
                        true
                    }
                };
                if let Some(attempt) = self.attempt_mut(header.transaction_id) {
                    if attempt.service != client.service {
                        debug!(
                            "Confirmation for service {:#04x} answers a request for {:#04x}",
                            client.service, attempt.service
                        );
                    }
                    attempt.state = if cut {
                        RegistrationState::Idle
                    } else {
                        RegistrationState::Confirmed
                    };
                }
                cut
            }
            (Side::Dsp, Event::RegisterRefused) => {
                if let Some(attempt) = self.attempt_mut(header.transaction_id) {
                    debug!("Baseband refused a client for service {:#04x}", attempt.service);
                    attempt.state = RegistrationState::Idle;
                }
                false
            }
            (Side::Dsp, Event::ReleaseConfirm(client)) => {
                self.clients.retain(|c| *c != client);
                debug!(
                    "Released client {} of service {:#04x}, {} left",
                    client.instance,
                    client.service,
                    self.clients.len()
                );
                false
            }
            _ => false,
        }
    }

    fn insert(&mut self, client: Client) -> Result<(), ProxyError> {
        if self.clients.contains(&client) {
            return Ok(());
        }
        if self.clients.len() >= MAX_CLIENTS {
            return Err(ProxyError::TrackerOverflow(self.clients.len()));
        }
        self.clients.push(client);
        self.last_registration = Some(SystemTime::now());
        debug!(
            "Registered client {} of service {:#04x}, {} active ({} for this service)",
            client.instance,
            client.service,
            self.clients.len(),
            self.instances_of(client.service)
        );
        Ok(())
    }

    /// Release requests for every service and instance the host could hold.
    pub fn release_sweep(&mut self) -> impl Iterator<Item = Result<Vec<u8>, FrameError>> + '_ {
        (0..=u8::MAX)
            .flat_map(|service| (0..=SWEEP_MAX_INSTANCE).map(move |instance| (service, instance)))
            .map(|(service, instance)| {
                self.sweep_transaction = self.sweep_transaction.wrapping_add(1).max(1);
                release_request(self.sweep_transaction, service, instance)
            })
    }

    /// Forgets every client, as after a completed sweep.
    pub fn clear(&mut self) {
        info!("Clearing {} tracked clients", self.clients.len());
        self.clients.clear();
        self.attempts.clear();
        self.resets += 1;
    }
}

/// A control-service release request for one client.
pub fn release_request(transaction_id: u8, service: u8, instance: u8) -> Result<Vec<u8>, FrameError> {
    let mut builder = qmi::build_header(
        QmuxFlags::empty(),
        Service::Control.into(),
        0,
        MessageKind::Request,
        u16::from(transaction_id),
        ControlMessage::ReleaseClientId.into(),
    );
    builder.add_tlv(TLV_CLIENT, &[service, instance])?;
    Ok(builder.finish())
}

/// How a hard reset went.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct ResetReport {
    pub released: usize,
    pub drained: usize,
    pub completed: bool,
}

/// Time budget for one hard reset.
#[derive(Debug, Copy, Clone)]
pub struct ResetBudget {
    deadline: Instant,
    quiet: Duration,
}

impl ResetBudget {
    pub fn new(total: Duration, quiet: Duration) -> Self {
        Self {
            deadline: Instant::now() + total,
            quiet,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Wait for the next drain read: the quiet window, cut short by the deadline.
    pub fn drain_wait(&self) -> Duration {
        self.deadline
            .saturating_duration_since(Instant::now())
            .min(self.quiet)
    }
}
