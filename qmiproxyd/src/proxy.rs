// src/proxy.rs

//! The bidirectional relay between the host and the baseband.
//!
//! Every frame is classified by service and handed to the engine that cares
//! about it. Engines only decide; this loop owns both endpoints and performs
//! every write, so a multi-step exchange is never interleaved with unrelated
//! traffic.

use chrono::Local;
use log::{debug, error, info, trace, warn};
use std::convert::Infallible;
use std::os::fd::AsFd;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::call::{AudioCue, CallEngine};
use crate::commands::CommandInterpreter;
use crate::config::Settings;
use crate::constants::{DRAIN_QUIET, POLL_INTERVAL, RESET_BUDGET, SWEEP_MAX_INSTANCE, Service};
use crate::error::{ProxyError, Result, Side};
use crate::pdu;
use crate::peripherals::{AudioControl, HostWaker};
use crate::qmi::{self, BROADCAST_CLIENT};
use crate::scheduler::{self, Command, Job, TaskTable};
use crate::sms::{Intercepted, SmsEngine, SmsSource};
use crate::tracker::{ClientTracker, ResetBudget, ResetReport};
use crate::transport::Endpoint;
use crate::utils;

/// What happens to a frame an engine has looked at.
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Verdict {
    /// Forward the original bytes to the peer.
    Relay,
    /// Drop the original bytes.
    Discard,
    /// Drop the original bytes and answer the host with these frames, in order.
    Respond(Vec<Vec<u8>>),
}

/// The engines' state, threaded through every dispatch.
#[derive(Debug)]
pub struct Context {
    pub call: CallEngine,
    pub sms: SmsEngine,
    pub tracker: ClientTracker,
}

impl Context {
    pub fn new(settings: &Settings) -> Self {
        Self {
            call: CallEngine::new(&settings.reserved_number),
            sms: SmsEngine::new(&settings.reserved_number),
            tracker: ClientTracker::new(settings.reset_threshold),
        }
    }
}

/// The daemon's non-modem collaborators.
pub struct Collaborators {
    pub interpreter: Box<dyn CommandInterpreter>,
    pub audio: Box<dyn AudioControl>,
    pub waker: Box<dyn HostWaker>,
}

/// Keeps the loop alive through everything except a vanished transport.
fn absorb(result: Result<()>) -> Result<()> {
    match result {
        Err(ProxyError::TransportClosed(side)) => Err(ProxyError::TransportClosed(side)),
        Err(e) => {
            warn!("{}", e);
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

pub struct Proxy {
    host: Endpoint,
    dsp: Endpoint,
    settings: Settings,
    ctx: Context,
    jobs: Receiver<Job>,
    tasks: Arc<Mutex<TaskTable>>,
    interpreter: Box<dyn CommandInterpreter>,
    audio: Box<dyn AudioControl>,
    waker: Box<dyn HostWaker>,
    host_online: bool,
    line_checked: Option<Instant>,
    do_not_disturb: bool,
}

impl Proxy {
    pub fn new(
        host: Endpoint,
        dsp: Endpoint,
        settings: Settings,
        jobs: Receiver<Job>,
        tasks: Arc<Mutex<TaskTable>>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            ctx: Context::new(&settings),
            host,
            dsp,
            settings,
            jobs,
            tasks,
            interpreter: collaborators.interpreter,
            audio: collaborators.audio,
            waker: collaborators.waker,
            host_online: true,
            line_checked: None,
            do_not_disturb: false,
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Swaps in a reopened transport, keeping all engine state.
    pub fn replace_endpoint(&mut self, endpoint: Endpoint) {
        info!("Resuming with reopened {} transport", endpoint.side());
        match endpoint.side() {
            Side::Host => self.host = endpoint,
            Side::Dsp => self.dsp = endpoint,
        }
    }

    /// Relays until a transport closes.
    pub fn run(&mut self) -> Result<Infallible> {
        info!(
            "Proxying between {:?} and {:?}",
            self.host.path(),
            self.dsp.path()
        );
        loop {
            match self.poll_once(POLL_INTERVAL) {
                Ok(()) => {}
                Err(ProxyError::TransportClosed(side)) => return Err(ProxyError::TransportClosed(side)),
                Err(e) => {
                    error!("Proxy loop error: {}", e);
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    /// One pass: wait for traffic, dispatch it, then run due tasks.
    pub fn poll_once(&mut self, timeout: Duration) -> Result<()> {
        let ready = utils::poll_fds(
            &[self.host.as_fd(), self.dsp.as_fd()],
            libc::POLLIN,
            timeout,
        )?;
        if ready[0] {
            let frame = self.host.read_frame();
            absorb(frame.and_then(|f| self.handle_host_frame(f)))?;
        }
        if ready[1] {
            let frame = self.dsp.read_frame();
            absorb(frame.and_then(|f| self.handle_dsp_frame(f)))?;
        }
        if self.line_checked.is_none_or(|at| at.elapsed() >= POLL_INTERVAL) {
            self.refresh_line_state();
        }
        while let Ok(job) = self.jobs.try_recv() {
            let result = self.execute(job.command);
            scheduler::lock(&self.tasks).finish(job.task, result.is_ok());
            absorb(result)?;
        }
        Ok(())
    }

    fn refresh_line_state(&mut self) {
        self.line_checked = Some(Instant::now());
        // Devices without line state reporting are always considered up.
        let Ok(online) = self.host.line_state() else {
            return;
        };
        if online != self.host_online {
            info!("Host line is now {}", if online { "up" } else { "down" });
            self.host_online = online;
            self.log_status();
        }
    }

    fn log_status(&self) {
        let ctx = &self.ctx;
        info!(
            "call {:?} ({:?}), sms {:?}, registration {:?} with {} clients, {} resets, dnd {}",
            ctx.call.state(),
            ctx.call.direction(),
            ctx.sms.pending(),
            ctx.tracker.state(),
            ctx.tracker.active_count(),
            ctx.tracker.resets(),
            self.do_not_disturb
        );
    }

    /// Dispatches a frame read from the host.
    pub fn handle_host_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        let header = match qmi::parse_header(&frame) {
            Ok(header) => header,
            Err(e) => {
                debug!("Relaying unparsed host frame: {}", ProxyError::from(e));
                return self.dsp.send(&frame);
            }
        };
        trace!(
            "host: service {:#04x} message {:#06x} txn {}",
            header.service, header.message_id, header.transaction_id
        );
        match header.service() {
            Some(Service::Control) => {
                if self.ctx.tracker.track_registration(&frame, Side::Host) {
                    self.hard_reset()?;
                    return Ok(());
                }
                self.dsp.send(&frame)
            }
            Some(Service::Voice) => {
                let outcome = self.ctx.call.handle_call_packet(&frame, Side::Host);
                self.apply_audio(outcome.audio);
                self.apply_verdict(outcome.verdict, &frame, Side::Host)
            }
            Some(Service::Wms) => match self.ctx.sms.handle_outgoing_sms(&frame)? {
                Some(Intercepted { ack, text }) => {
                    self.host.send(&ack)?;
                    let reply = self.interpreter.interpret(&text);
                    self.deliver_sms(&reply.text, SmsSource::Internal)?;
                    match reply.command {
                        Some(command) => self.execute(command),
                        None => Ok(()),
                    }
                }
                None => self.dsp.send(&frame),
            },
            _ => self.dsp.send(&frame),
        }
    }

    /// Dispatches a frame read from the baseband.
    pub fn handle_dsp_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        let header = match qmi::parse_header(&frame) {
            Ok(header) => header,
            Err(e) => {
                debug!("Relaying unparsed baseband frame: {}", ProxyError::from(e));
                return self.relay(&frame, Side::Dsp);
            }
        };
        match header.service() {
            Some(Service::Control) => {
                let cut = self.ctx.tracker.track_registration(&frame, Side::Dsp);
                self.relay(&frame, Side::Dsp)?;
                if cut {
                    self.hard_reset()?;
                }
                Ok(())
            }
            Some(Service::Voice) => {
                let outcome = self.ctx.call.handle_call_packet(&frame, Side::Dsp);
                self.apply_audio(outcome.audio);
                self.apply_verdict(outcome.verdict, &frame, Side::Dsp)
            }
            _ => self.relay(&frame, Side::Dsp),
        }
    }

    /// Forwards `frame` from `from` to its peer.
    fn relay(&self, frame: &[u8], from: Side) -> Result<()> {
        match from.peer() {
            Side::Dsp => self.dsp.send(frame),
            Side::Host if self.host_online => self.host.send(frame),
            Side::Host => {
                trace!("Host line down, dropping {} byte frame", frame.len());
                Ok(())
            }
        }
    }

    fn apply_verdict(&self, verdict: Verdict, frame: &[u8], from: Side) -> Result<()> {
        match verdict {
            Verdict::Relay => self.relay(frame, from),
            Verdict::Discard => Ok(()),
            Verdict::Respond(frames) => {
                for (i, response) in frames.iter().enumerate() {
                    if i > 0 && !self.settings.call_pacing.is_zero() {
                        thread::sleep(self.settings.call_pacing);
                    }
                    self.host.send(response)?;
                }
                Ok(())
            }
        }
    }

    fn apply_audio(&mut self, cue: Option<AudioCue>) {
        match cue {
            Some(AudioCue::Start(profile)) => self.audio.start_audio(profile),
            Some(AudioCue::Stop) => self.audio.stop_audio(),
            None => {}
        }
    }

    /// Carries out a command from the scheduler or the chat interpreter.
    ///
    /// An error means the command was not carried out.
    pub fn execute(&mut self, command: Command) -> Result<()> {
        debug!("Executing {:?}", command);
        match command {
            Command::InjectSms(text) => self.deliver_sms(&text, SmsSource::External),
            Command::StartCall if self.do_not_disturb => {
                info!("Do not disturb is on, sending a message instead of calling");
                self.deliver_sms("Call skipped: do not disturb is on", SmsSource::External)
            }
            Command::StartCall => {
                let client = self.ctx.tracker.client_for(Service::Voice).unwrap_or(BROADCAST_CLIENT);
                let ring = self.ctx.call.start_incoming(client)?;
                self.host.send(&ring)
            }
            Command::WakeHost(hold) => {
                self.waker.wake_host(hold);
                Ok(())
            }
            Command::SetDoNotDisturb(on) => {
                self.do_not_disturb = on;
                Ok(())
            }
        }
    }

    /// Injects `text`, split into as many messages as it needs.
    ///
    /// A part that fails its handshake ends the delivery. Host frames held
    /// back during each handshake are dispatched as if they had just arrived.
    /// Failed chat replies are only logged.
    fn deliver_sms(&mut self, text: &str, source: SmsSource) -> Result<()> {
        let client = self.ctx.tracker.client_for(Service::Wms).unwrap_or(BROADCAST_CLIENT);
        let mut outcome = Ok(());
        for part in pdu::split_for_sms(text) {
            let now = Local::now().fixed_offset();
            let sent = self
                .ctx
                .sms
                .inject(&self.host, client, &part, source, self.settings.step_timeout, now);
            for frame in self.ctx.sms.take_deferred() {
                absorb(self.handle_host_frame(frame))?;
            }
            if sent.is_err() {
                outcome = sent;
                break;
            }
        }
        match (source, outcome) {
            (_, Err(ProxyError::TransportClosed(side))) => Err(ProxyError::TransportClosed(side)),
            (SmsSource::Internal, Err(_)) => Ok(()),
            (_, outcome) => outcome,
        }
    }

    /// Releases every client the host could hold and bounces the host link.
    fn hard_reset(&mut self) -> Result<ResetReport> {
        warn!(
            "Resetting QMI clients ({} tracked, last registration {:?})",
            self.ctx.tracker.active_count(),
            self.ctx.tracker.last_registration()
        );
        let budget = ResetBudget::new(RESET_BUDGET, DRAIN_QUIET);
        let mut report = ResetReport::default();
        let batch = usize::from(SWEEP_MAX_INSTANCE) + 1;

        let releases: Vec<Vec<u8>> = self.ctx.tracker.release_sweep().collect::<Result<_, _>>()?;
        for (i, release) in releases.iter().enumerate() {
            if budget.expired() {
                warn!("Reset budget spent after {} releases", report.released);
                break;
            }
            if let Err(e) = self.dsp.send(release) {
                warn!("Release sweep interrupted: {}", e);
                break;
            }
            report.released += 1;
            if (i + 1) % batch == 0 {
                while self.dsp.recv(Duration::ZERO)?.is_some() {
                    report.drained += 1;
                }
            }
        }
        report.completed = report.released == releases.len();

        loop {
            let wait = budget.drain_wait();
            if wait.is_zero() || self.dsp.recv(wait)?.is_none() {
                break;
            }
            report.drained += 1;
        }

        self.ctx.tracker.clear();
        for online in [false, true] {
            if let Err(e) = self.host.set_modem_online(online) {
                warn!("Could not signal modem {} to host: {}", if online { "online" } else { "offline" }, e);
            }
        }
        info!(
            "Reset finished: {} releases sent, {} replies drained, complete: {}",
            report.released, report.drained, report.completed
        );
        self.log_status();
        Ok(report)
    }
}
