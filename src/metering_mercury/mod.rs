use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::Instant;

use crate::config::GatewayConfig;
use crate::get_unix_ts_ms;
use crate::mqtt::{Sample, Transmission, WorkingState};

pub mod protocol;
pub mod structs;
pub mod meter_definitions;
pub mod meter_list;
pub mod meters;

use meter_definitions::Catalogue;
use meters::MeterRegistry;
use protocol::STATUS_REPLY_LEN;
use structs::Meter;

pub const EXIT_OK: i32 = 0;
pub const EXIT_CONNECTION: i32 = 1;
pub const EXIT_STARTUP: i32 = 2;
pub const EXIT_NO_METERS: i32 = 3;
pub const EXIT_TIMEOUT: i32 = 99;

/// Time the connection gets to settle before the process goes away
pub const GRACE_PERIOD: Duration = Duration::from_millis(300);

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame too short: {}", hex::encode(.frame))]
    TooShort { frame: Vec<u8> },
    #[error("CRC mismatch, received {} expected {}", hex::encode(.received), hex::encode(.expected))]
    CrcMismatch { received: Vec<u8>, expected: Vec<u8> },
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("meter {address} answered with status {code:#04x}: {text}")]
    ExchangeStatus { address: u8, code: u8, text: String },
    #[error("{decoder} needs {need} payload bytes, got {len}")]
    PayloadTooShort { decoder: &'static str, len: usize, need: usize },
    #[error("poll template {0} not known")]
    UnknownTemplate(usize),
}

#[derive(Error, Debug)]
pub enum ResponseError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("reply from unknown address {address}: {}", hex::encode(.frame))]
    UnknownAddress { address: u8, frame: Vec<u8> },
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("no meters configured")]
    NoMeters,
    #[error("unable to connect to {addr}: {source}")]
    Connect { addr: String, #[source] source: std::io::Error },
    #[error("gateway closed the connection")]
    Disconnected,
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),
    #[error("{meter} (address {address}) did not answer {errors} times in a row")]
    TimeoutThreshold { meter: String, address: u8, errors: u32 },
}

impl AgentError {
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentError::NoMeters => EXIT_NO_METERS,
            AgentError::Connect { .. } | AgentError::Disconnected | AgentError::Connection(_) => EXIT_CONNECTION,
            AgentError::TimeoutThreshold { .. } => EXIT_TIMEOUT,
        }
    }
}

#[derive(Debug)]
pub enum AgentCommand {
    /// Stop sending and drop every reply until the next resume
    Suspend,
    /// Poll the given meters from now on
    Resume(Vec<Meter>),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Connecting,
    Polling,
    Suspended,
    Exiting,
}

pub struct MercuryAgent {
    config: GatewayConfig,
    catalogue: Arc<Catalogue>,
    registry: MeterRegistry,
    sender: Sender<Transmission>,
    commands: Receiver<AgentCommand>,
    state: AgentState,
    /* one request is outstanding */
    waiting: bool,
    send_time: Instant,
    /* the next request opens the channel of the first meter */
    first_meter: bool,
    /* a new meter list waits for the next tick */
    refresh_pending: bool,
    pending_send: Option<Instant>,
    rx_buf: Vec<u8>,
    expected_len: Option<usize>,
}

impl MercuryAgent {
    pub fn new(
        config: GatewayConfig,
        meters: Vec<Meter>,
        catalogue: Arc<Catalogue>,
        sender: Sender<Transmission>,
        commands: Receiver<AgentCommand>,
    ) -> Result<Self, AgentError> {
        if meters.is_empty() {
            return Err(AgentError::NoMeters);
        }

        Ok(MercuryAgent {
            config,
            catalogue,
            registry: MeterRegistry::new(meters),
            sender,
            commands,
            state: AgentState::Connecting,
            waiting: false,
            send_time: Instant::now(),
            first_meter: true,
            refresh_pending: false,
            pending_send: None,
            rx_buf: Vec::new(),
            expected_len: None,
        })
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Connects to the gateway and polls until a fatal error or a shutdown command
    pub async fn run(mut self) -> Result<(), AgentError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("Connecting to gateway {addr}");
        let mut stream = match TcpStream::connect(&addr).await {
            Ok(s) => s,
            Err(source) => {
                self.state = AgentState::Exiting;
                let e = AgentError::Connect { addr, source };
                error!("{e}");
                tokio::time::sleep(GRACE_PERIOD).await;
                return Err(e);
            }
        };
        let _ = stream.set_nodelay(true);

        info!("Connected to {addr}, polling {} meters", self.registry.len());
        self.state = AgentState::Polling;
        let _ = self.sender.send(Transmission::State(WorkingState::Working)).await;

        let result = self.poll_loop(&mut stream).await;
        self.state = AgentState::Exiting;

        match &result {
            Ok(_) => info!("Polling stopped, closing connection to {addr}"),
            Err(e) => error!("Polling stopped: {e}"),
        }

        let _ = stream.shutdown().await;
        tokio::time::sleep(GRACE_PERIOD).await;
        result
    }

    async fn poll_loop(&mut self, stream: &mut TcpStream) -> Result<(), AgentError> {
        self.first_meter = true;
        if let Some(frame) = self.next_request() {
            write_frame(stream, &frame).await?;
        }

        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.tick.max(1)));
        ticker.tick().await;

        let mut buf = [0u8; 256];
        let mut commands_open = true;

        loop {
            let delay = self.pending_send;

            tokio::select! {
                read = stream.read(&mut buf) => {
                    match read {
                        Ok(0) => return Err(AgentError::Disconnected),
                        Ok(n) => {
                            if let Some(frame) = self.assemble(&buf[..n]) {
                                self.on_response(&frame).await;
                            }
                        }
                        Err(e) => return Err(AgentError::Connection(e)),
                    }
                }
                _ = ticker.tick() => {
                    if let Some(frame) = self.on_tick().await? {
                        write_frame(stream, &frame).await?;
                    }
                }
                _ = tokio::time::sleep_until(delay.unwrap_or_else(Instant::now)), if delay.is_some() => {
                    self.pending_send = None;
                    if let Some(frame) = self.next_request() {
                        write_frame(stream, &frame).await?;
                    }
                }
                command = self.commands.recv(), if commands_open => {
                    match command {
                        Some(command) => {
                            if self.on_command(command)? {
                                return Ok(());
                            }
                        }
                        None => {
                            debug!("Command channel closed");
                            commands_open = false;
                        }
                    }
                }
            }
        }
    }

    /*
        Collects bytes until the outstanding request has its full reply. Buffered bytes
        that already form a frame with a valid CRC end it early, whatever its length, so
        status replies and late replies to an earlier request stay intact. Otherwise
        bytes past the expected length are dropped.
    */
    fn assemble(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        let expected = match self.expected_len {
            Some(len) if self.waiting => len,
            _ => return Some(chunk.to_vec()),
        };

        self.rx_buf.extend_from_slice(chunk);

        if self.rx_buf.len() >= protocol::MIN_FRAME_LEN && protocol::verify_crc(&self.rx_buf) {
            return Some(std::mem::take(&mut self.rx_buf));
        }

        if self.rx_buf.len() >= expected {
            if self.rx_buf.len() > expected {
                debug!("Dropping {} surplus bytes", self.rx_buf.len() - expected);
                self.rx_buf.truncate(expected);
            }
            return Some(std::mem::take(&mut self.rx_buf));
        }
        None
    }

    fn timed_out(&self) -> bool {
        self.waiting && self.send_time.elapsed() > Duration::from_millis(self.config.timeout)
    }

    /// Next frame to put on the wire, `None` if nothing may be sent now
    fn next_request(&mut self) -> Option<Vec<u8>> {
        if self.state != AgentState::Polling || self.refresh_pending {
            return None;
        }

        if self.first_meter {
            self.first_meter = false;
            let meter = self.registry.first_meter()?;
            let request = protocol::auth_request(&meter.password);
            return self.start_exchange(&request, STATUS_REPLY_LEN);
        }

        let mut next = None;
        while let Some(idx) = self.registry.next_due_poll_index() {
            match self.catalogue.get(idx) {
                Some(template) => {
                    next = Some((template.request.clone(), template.reply_len));
                    break;
                }
                None => error!("Poll template {idx} not known, skipping"),
            }
        }

        match next {
            Some((request, reply_len)) => self.start_exchange(&request, reply_len),
            None => {
                /* sweep of this meter done */
                let meter = self.registry.next_meter()?;
                let request = protocol::auth_request(&meter.password);
                self.start_exchange(&request, STATUS_REPLY_LEN)
            }
        }
    }

    fn start_exchange(&mut self, request: &[u8], reply_len: usize) -> Option<Vec<u8>> {
        let meter = self.registry.current_meter()?;
        let frame = protocol::finalize(request, meter.address);
        debug!("{} <= {}", meter.name, hex::encode(&frame));

        self.waiting = true;
        self.send_time = Instant::now();
        self.expected_len = Some(reply_len);
        self.rx_buf.clear();
        Some(frame)
    }

    fn conclude_exchange(&mut self) {
        self.waiting = false;
        self.expected_len = None;
        self.rx_buf.clear();
    }

    pub async fn on_response(&mut self, frame: &[u8]) {
        if self.state == AgentState::Suspended {
            debug!("Suspended, discarding {}", hex::encode(frame));
            self.conclude_exchange();
            return;
        }

        if self.refresh_pending {
            debug!("Meter list replaced, discarding {}", hex::encode(frame));
            self.conclude_exchange();
            return;
        }

        if !self.waiting {
            warn!("Unexpected frame {}", hex::encode(frame));
            return;
        }

        match self.handle_frame(frame) {
            Ok(Some(samples)) => {
                if !samples.is_empty() {
                    let _ = self.sender.send(Transmission::Metering(samples)).await;
                }
            }
            /* reply to an earlier request, the current one is still open */
            Ok(None) => return,
            Err(e) => error!("{e}"),
        }

        self.conclude_exchange();
        self.pending_send = Some(Instant::now() + Duration::from_millis(self.config.polldelay));
    }

    /// Samples of the reply, `None` when it came from another meter than the one asked
    fn handle_frame(&mut self, frame: &[u8]) -> Result<Option<Vec<Sample>>, ResponseError> {
        protocol::check_frame(frame)?;

        let address = match protocol::parse_address(frame) {
            Some(a) if self.registry.meter_by_address(a).is_some() => a,
            Some(a) => return Err(ResponseError::UnknownAddress { address: a, frame: frame.to_vec() }),
            None => return Err(FrameError::TooShort { frame: frame.to_vec() }.into()),
        };

        if self.registry.current_meter().map(|m| m.address) != Some(address) {
            warn!("Late reply from address {address} ignored: {}", hex::encode(frame));
            return Ok(None);
        }

        let meter = match self.registry.meter_by_address_mut(address) {
            Some(m) => m,
            None => return Err(ResponseError::UnknownAddress { address, frame: frame.to_vec() }),
        };
        debug!("{} => {}", meter.name, hex::encode(frame));
        meter.errors = 0;

        protocol::check_status(frame)?;

        let idx = match meter.current_template() {
            Some(idx) => idx,
            None => {
                debug!("{}: channel open", meter.name);
                return Ok(Some(Vec::new()));
            }
        };

        let template = self.catalogue.get(idx).ok_or(DecodeError::UnknownTemplate(idx))?;
        let readings = protocol::decode(
            template.decoder,
            protocol::payload(frame),
            template.class,
            template.chan.as_ref(),
            &meter.calibration,
        )?;

        let ts = get_unix_ts_ms();
        let mut samples = Vec::new();
        for reading in readings {
            match meter.channels.get(&reading.chan) {
                Some(channel) => samples.push(Sample::reading(&channel.id, channel.key.as_str(), reading.value, ts, &meter.name)),
                None => debug!("{}: {} is not configured, dropping", meter.name, reading.chan),
            }
        }
        Ok(Some(samples))
    }

    pub async fn on_tick(&mut self) -> Result<Option<Vec<u8>>, AgentError> {
        if self.state == AgentState::Suspended {
            return Ok(None);
        }

        if self.refresh_pending {
            /* let the request in flight finish first */
            if self.waiting && !self.timed_out() {
                return Ok(None);
            }
            self.refresh_pending = false;
            self.conclude_exchange();
            self.first_meter = true;
            info!("Starting a new sweep over {} meters", self.registry.len());
            return Ok(self.next_request());
        }

        if !self.timed_out() {
            return Ok(None);
        }
        self.conclude_exchange();

        let (faults, name, address, errors) = {
            let meter = match self.registry.current_meter_mut() {
                Some(m) => m,
                None => return Ok(None),
            };
            meter.errors += 1;

            let ts = get_unix_ts_ms();
            let faults: Vec<Sample> = meter
                .remaining_channels(&self.catalogue)
                .iter()
                .map(|c| Sample::fault(&c.id, c.key.as_str(), ts, &meter.name))
                .collect();
            (faults, meter.name.clone(), meter.address, meter.errors)
        };

        if errors >= self.config.max_errors {
            return Err(AgentError::TimeoutThreshold { meter: name, address, errors });
        }

        error!("{name} (address {address}): no reply within {} ms, {errors} of {} errors", self.config.timeout, self.config.max_errors);
        if !faults.is_empty() {
            let _ = self.sender.send(Transmission::Metering(faults)).await;
        }

        self.pending_send = None;
        let request = {
            let meter = match self.registry.next_meter() {
                Some(m) => m,
                None => return Ok(None),
            };
            protocol::auth_request(&meter.password)
        };
        Ok(self.start_exchange(&request, STATUS_REPLY_LEN))
    }

    /// Returns true when the agent should stop
    pub fn on_command(&mut self, command: AgentCommand) -> Result<bool, AgentError> {
        match command {
            AgentCommand::Suspend => {
                info!("Polling suspended");
                self.state = AgentState::Suspended;
                self.pending_send = None;
            }
            AgentCommand::Resume(meters) => {
                if meters.is_empty() {
                    return Err(AgentError::NoMeters);
                }
                info!("Polling resumed with {} meters", meters.len());
                self.registry.replace(meters);
                self.state = AgentState::Polling;
                self.first_meter = true;
                self.refresh_pending = true;
                self.pending_send = None;
            }
            AgentCommand::Shutdown => {
                info!("Shutdown requested");
                return Ok(true);
            }
        }
        Ok(false)
    }
}

async fn write_frame(stream: &mut TcpStream, frame: &[u8]) -> Result<(), AgentError> {
    stream.write_all(frame).await.map_err(AgentError::Connection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AddressConfig, DeviceItem};
    use crate::metering_mercury::protocol::Measurement;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn gateway(port: u16, timeout: u64, tick: u64) -> GatewayConfig {
        GatewayConfig {
            host: "127.0.0.1".to_string(),
            port,
            timeout,
            polldelay: 5,
            max_errors: 10,
            tick,
        }
    }

    fn devices(address: u64) -> Vec<DeviceItem> {
        vec![
            DeviceItem {
                id: "n1".to_string(),
                foldertype: Some("node".to_string()),
                folder: true,
                chan: "Meter 101".to_string(),
                addr: Some(AddressConfig::Number(address)),
                polltimefctr: 1,
                ..Default::default()
            },
            DeviceItem {
                id: "c1".to_string(),
                parent: Some("n1".to_string()),
                chan: "U1".to_string(),
                r: true,
                polltimefctr: 1,
                order: 1,
                ..Default::default()
            },
        ]
    }

    fn meters(address: u64, catalogue: &Catalogue) -> Vec<Meter> {
        meter_list::build_meter_list(&devices(address), catalogue)
    }

    fn two_meters(catalogue: &Catalogue) -> Vec<Meter> {
        let mut items = devices(0x4b);
        items.extend(devices(0x53).into_iter().map(|mut d| {
            d.id = format!("{}b", d.id);
            if d.parent.is_some() {
                d.parent = Some("n1b".to_string());
            } else {
                d.chan = "Meter 102".to_string();
            }
            d
        }));
        meter_list::build_meter_list(&items, catalogue)
    }

    struct Harness {
        agent: MercuryAgent,
        mqtt: mpsc::Receiver<Transmission>,
        _commands: mpsc::Sender<AgentCommand>,
    }

    fn harness() -> Harness {
        let catalogue = Arc::new(Catalogue::new());
        let (tx, rx) = mpsc::channel(100);
        let (ctx, crx) = mpsc::channel(10);
        let mut agent = MercuryAgent::new(gateway(0, 1000, 10), meters(0x4b, &catalogue), catalogue, tx, crx).unwrap();
        agent.state = AgentState::Polling;
        Harness { agent, mqtt: rx, _commands: ctx }
    }

    fn reply(data: &[u8]) -> Vec<u8> {
        protocol::finalize(data, data[0])
    }

    #[test]
    fn test_no_meters() {
        let (tx, _rx) = mpsc::channel(1);
        let (_ctx, crx) = mpsc::channel(1);
        let r = MercuryAgent::new(gateway(0, 10, 10), vec![], Arc::new(Catalogue::new()), tx, crx);
        assert_eq!(r.err().unwrap().exit_code(), EXIT_NO_METERS);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(AgentError::Disconnected.exit_code(), EXIT_CONNECTION);
        let e = AgentError::TimeoutThreshold { meter: "M".to_string(), address: 1, errors: 10 };
        assert_eq!(e.exit_code(), EXIT_TIMEOUT);
        assert_eq!(e.to_string(), "M (address 1) did not answer 10 times in a row");
    }

    #[tokio::test]
    async fn test_exchange_sequence() {
        let mut h = harness();

        let auth = h.agent.next_request().unwrap();
        assert_eq!(hex::encode(&auth), "4b01010101010101013572");

        h.agent.on_response(&hex::decode("4b003740").unwrap()).await;
        assert!(!h.agent.waiting);
        assert!(h.agent.pending_send.is_some());
        assert!(h.mqtt.try_recv().is_err());

        let req = h.agent.next_request().unwrap();
        assert_eq!(&req[..4], &[0x4b, 0x08, 0x11, 0x11]);
        assert!(protocol::verify_crc(&req));

        h.agent.on_response(&hex::decode("4b005d0aaf57").unwrap()).await;
        match h.mqtt.try_recv().unwrap() {
            Transmission::Metering(samples) => {
                assert_eq!(samples.len(), 1);
                assert_eq!(samples[0].id, "c1");
                assert_eq!(samples[0].chan, "U1");
                assert_eq!(samples[0].value, Some(Measurement::Value(238.18)));
                assert_eq!(samples[0].parentname, "Meter 101");
            }
            other => panic!("unexpected {other:?}"),
        }

        /* end of plan, back to the auth of the (only) meter */
        let again = h.agent.next_request().unwrap();
        assert_eq!(again, auth);
    }

    #[tokio::test]
    async fn test_suspended_discards_replies() {
        let mut h = harness();
        h.agent.next_request().unwrap();
        assert!(!h.agent.on_command(AgentCommand::Suspend).unwrap());

        h.agent.on_response(&hex::decode("4b003740").unwrap()).await;
        assert!(!h.agent.waiting);
        assert!(h.agent.pending_send.is_none());
        assert!(h.agent.next_request().is_none());
        assert!(h.agent.on_tick().await.unwrap().is_none());
        assert!(matches!(h.mqtt.try_recv(), Err(mpsc::error::TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_broken_frames_are_dropped() {
        let mut h = harness();
        h.agent.next_request().unwrap();
        h.agent.registry.current_meter_mut().unwrap().errors = 3;

        h.agent.on_response(&hex::decode("4b003741").unwrap()).await;
        assert!(!h.agent.waiting);
        assert_eq!(h.agent.registry.current_meter().unwrap().errors, 3);

        h.agent.next_request().unwrap();
        h.agent.on_response(&reply(&[0x10, 0x00])).await;
        assert!(!h.agent.waiting);
        assert!(h.mqtt.try_recv().is_err());

        h.agent.next_request().unwrap();
        h.agent.on_response(&reply(&[0x4b, 0x07])).await;
        assert_eq!(h.agent.registry.current_meter().unwrap().errors, 0);
        assert!(h.mqtt.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unexpected_frame_is_ignored() {
        let mut h = harness();
        h.agent.on_response(&hex::decode("4b003740").unwrap()).await;
        assert!(h.agent.pending_send.is_none());
    }

    #[test]
    fn test_frame_assembly() {
        let mut h = harness();
        assert_eq!(h.agent.assemble(&[1, 2]), Some(vec![1, 2]));

        h.agent.next_request().unwrap();
        h.agent.expected_len = Some(6);
        assert_eq!(h.agent.assemble(&[0x4b, 0x00, 0x5d]), None);
        assert_eq!(h.agent.assemble(&[0x0a, 0xaf, 0x57, 0xff]), Some(hex::decode("4b005d0aaf57").unwrap()));

        assert_eq!(h.agent.assemble(&hex::decode("4b077682").unwrap()), Some(hex::decode("4b077682").unwrap()));
    }

    #[tokio::test]
    async fn test_late_reply_after_timeout_keeps_exchange_open() {
        let catalogue = Arc::new(Catalogue::new());
        let (tx, mut rx) = mpsc::channel(100);
        let (_ctx, crx) = mpsc::channel(10);
        let list = two_meters(&catalogue);
        assert_eq!(list.len(), 2);
        let mut agent = MercuryAgent::new(gateway(0, 1000, 10), list, catalogue, tx, crx).unwrap();
        agent.state = AgentState::Polling;

        agent.next_request().unwrap();
        agent.on_response(&hex::decode("4b003740").unwrap()).await;
        let req = agent.next_request().unwrap();
        assert_eq!(&req[..4], &[0x4b, 0x08, 0x11, 0x11]);

        /* 0x4b stays silent past the timeout, the agent moves on to 0x53 */
        agent.send_time = Instant::now() - Duration::from_millis(2000);
        let auth = agent.on_tick().await.unwrap().unwrap();
        assert_eq!(auth[0], 0x53);
        assert_eq!(agent.expected_len, Some(STATUS_REPLY_LEN));
        assert!(matches!(rx.try_recv().unwrap(), Transmission::Metering(_)));

        /* the reply of 0x4b arrives late and must not be cut to the auth length */
        let late = hex::decode("4b005d0aaf57").unwrap();
        let frame = agent.assemble(&late).unwrap();
        assert_eq!(frame, late);

        agent.on_response(&frame).await;
        assert!(agent.waiting);
        assert!(agent.pending_send.is_none());
        assert!(rx.try_recv().is_err());

        let ok = reply(&[0x53, 0x00]);
        let frame = agent.assemble(&ok).unwrap();
        agent.on_response(&frame).await;
        assert!(!agent.waiting);
        assert!(agent.pending_send.is_some());
    }

    #[tokio::test]
    async fn test_connect_failure_waits_grace_period() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let catalogue = Arc::new(Catalogue::new());
        let (tx, _rx) = mpsc::channel(10);
        let (_ctx, crx) = mpsc::channel(10);
        let agent = MercuryAgent::new(gateway(port, 1000, 10), meters(0x4b, &catalogue), catalogue, tx, crx).unwrap();

        let started = std::time::Instant::now();
        let err = agent.run().await.unwrap_err();
        assert!(matches!(err, AgentError::Connect { .. }));
        assert_eq!(err.exit_code(), EXIT_CONNECTION);
        assert!(started.elapsed() >= GRACE_PERIOD);
    }

    #[tokio::test]
    async fn test_resume_starts_new_sweep() {
        let mut h = harness();
        h.agent.next_request().unwrap();
        h.agent.on_command(AgentCommand::Suspend).unwrap();

        let catalogue = Catalogue::new();
        h.agent.on_command(AgentCommand::Resume(meters(0x53, &catalogue))).unwrap();
        assert_eq!(h.agent.state(), AgentState::Polling);
        assert!(h.agent.next_request().is_none());

        /* the old auth is still in flight */
        assert!(h.agent.on_tick().await.unwrap().is_none());
        h.agent.on_response(&hex::decode("4b003740").unwrap()).await;
        assert!(!h.agent.waiting);

        let frame = h.agent.on_tick().await.unwrap().unwrap();
        assert_eq!(frame[0], 0x53);
        assert_eq!(frame[1], protocol::CMD_OPEN_CHANNEL);

        assert!(matches!(h.agent.on_command(AgentCommand::Resume(vec![])), Err(AgentError::NoMeters)));
        assert!(h.agent.on_command(AgentCommand::Shutdown).unwrap());
    }

    #[tokio::test]
    async fn test_polls_simulated_meter() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            loop {
                let n = match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let answer = match buf[1] {
                    protocol::CMD_OPEN_CHANNEL => reply(&[buf[0], 0x00]),
                    _ if n >= 4 && buf[..4] == [0x4b, 0x08, 0x11, 0x11] => reply(&[buf[0], 0x00, 0x5d, 0x0a]),
                    _ => reply(&[buf[0], 0x01]),
                };
                if socket.write_all(&answer).await.is_err() {
                    break;
                }
            }
        });

        let catalogue = Arc::new(Catalogue::new());
        let (tx, mut rx) = mpsc::channel(100);
        let (ctx, crx) = mpsc::channel(10);
        let agent = MercuryAgent::new(gateway(port, 1000, 10), meters(0x4b, &catalogue), catalogue, tx, crx).unwrap();
        let handle = tokio::spawn(agent.run());

        assert_eq!(rx.recv().await.unwrap(), Transmission::State(WorkingState::Working));
        match rx.recv().await.unwrap() {
            Transmission::Metering(samples) => {
                assert_eq!(samples[0].chan, "U1");
                assert_eq!(samples[0].value, Some(Measurement::Value(238.18)));
            }
            other => panic!("unexpected {other:?}"),
        }

        ctx.send(AgentCommand::Shutdown).await.unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_ten_timeouts_are_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 64];
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                }
            }
            received
        });

        let catalogue = Arc::new(Catalogue::new());
        let (tx, mut rx) = mpsc::channel(100);
        let (_ctx, crx) = mpsc::channel(10);
        let agent = MercuryAgent::new(gateway(port, 30, 10), meters(0x4b, &catalogue), catalogue, tx, crx).unwrap();

        let err = agent.run().await.unwrap_err();
        assert_eq!(err.exit_code(), EXIT_TIMEOUT);
        assert!(matches!(err, AgentError::TimeoutThreshold { errors: 10, address: 0x4b, .. }));

        let received = server.await.unwrap();
        let auth = hex::decode("4b01010101010101013572").unwrap();
        assert_eq!(received.len(), 10 * auth.len());
        assert!(received.chunks(auth.len()).all(|c| c == auth.as_slice()));

        let mut faults = 0;
        while let Ok(t) = rx.try_recv() {
            if let Transmission::Metering(samples) = t {
                assert_eq!(samples.len(), 1);
                assert_eq!(samples[0].chstatus, Some(1));
                assert_eq!(samples[0].value, None);
                faults += 1;
            }
        }
        assert_eq!(faults, 9);
    }
}
