//! Linux Bluetooth management (`mgmt`) protocol client.
//!
//! The controller is driven over a raw HCI control-channel socket using the
//! kernel's binary management protocol: framed commands answered by
//! `CommandComplete`/`CommandStatus`, plus unsolicited events for settings
//! changes and connections. A dedicated reader thread parses frames and
//! routes them; commands are issued one at a time from the server loop.

use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

pub use {consts::*, sock::*};

use crate::SyncMutex;

mod consts;
mod sock;

/// Error type returned by the management layer.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("mgmt socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("controller initialization error: {0}")]
    Init(&'static str),
    #[error("{opcode} command failed: {status}")]
    CommandFailed { opcode: Opcode, status: Status },
    #[error("{opcode} command timeout")]
    CommandTimeout { opcode: Opcode },
    #[error("invalid event: {0:02X?}")]
    InvalidEvent(Vec<u8>),
    #[error("mgmt channel closed")]
    Closed,
}

/// Common management result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Frame header: opcode/event code, controller index, parameter length.
pub(crate) const MGMT_HDR: usize = 6;

/// Controller index wildcard used when binding the control channel.
pub(crate) const INDEX_NONE: u16 = 0xFFFF;

/// Management transport layer. The production implementation is
/// [`MgmtSocket`]; tests substitute loopback fakes.
pub trait Transport: Send + Sync + 'static {
    /// Writes one complete command frame.
    fn write_cmd(&self, b: &[u8]) -> std::io::Result<()>;

    /// Reads one complete event frame into `buf`, blocking for at most the
    /// transport's poll interval. Returns `Ok(0)` if no frame arrived.
    fn read_event(&self, buf: &mut [u8]) -> std::io::Result<usize>;
}

/// Bluetooth device address stored in little-endian byte order.
#[derive(Clone, Copy, Default, Eq, PartialEq)]
#[repr(transparent)]
pub struct Address([u8; 6]);

impl From<[u8; 6]> for Address {
    #[inline]
    fn from(v: [u8; 6]) -> Self {
        Self(v)
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[5], self.0[4], self.0[3], self.0[2], self.0[1], self.0[0]
        )
    }
}

impl Display for Address {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Static and current controller state returned by `ReadControllerInfo`.
#[derive(Clone, Debug, Default)]
pub struct ControllerInfo {
    pub address: Address,
    pub version: u8,
    pub manufacturer: u16,
    pub supported: Settings,
    pub current: Settings,
    pub class_of_device: [u8; 3],
    pub name: String,
    pub short_name: String,
}

impl ControllerInfo {
    /// Parses `ReadControllerInfo` return parameters.
    fn parse(mut p: Bytes) -> Result<Self> {
        if p.len() < 6 + 1 + 2 + 4 + 4 + 3 {
            return Err(Error::InvalidEvent(p.to_vec()));
        }
        let mut addr = [0; 6];
        p.copy_to_slice(&mut addr);
        let version = p.get_u8();
        let manufacturer = p.get_u16_le();
        let supported = Settings::from_bits_truncate(p.get_u32_le());
        let current = Settings::from_bits_truncate(p.get_u32_le());
        let mut class_of_device = [0; 3];
        p.copy_to_slice(&mut class_of_device);
        let name = take_name(&mut p, 249);
        let short_name = take_name(&mut p, 11);
        Ok(Self {
            address: Address(addr),
            version,
            manufacturer,
            supported,
            current,
            class_of_device,
            name,
            short_name,
        })
    }
}

/// Consumes a fixed-size NUL-terminated name field.
fn take_name(p: &mut Bytes, n: usize) -> String {
    let raw = p.split_to(n.min(p.len()));
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Connection events surfaced to the server loop for logging.
#[derive(Clone, Copy, Debug)]
pub enum DeviceEvent {
    Connected(Address),
    Disconnected(Address, u8),
}

/// Management command encoder.
#[derive(Debug)]
struct Cmd {
    b: BytesMut,
}

impl Cmd {
    fn new(opcode: Opcode, index: u16) -> Self {
        let mut b = BytesMut::with_capacity(MGMT_HDR + 32);
        b.put_u16_le(opcode.into());
        b.put_u16_le(index);
        b.put_u16_le(0); // Parameter length is set in as_bytes()
        Self { b }
    }

    fn u8(&mut self, v: u8) -> &mut Self {
        self.b.put_u8(v);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.b.put_u16_le(v);
        self
    }

    /// Appends a fixed-size NUL-padded name field.
    fn name(&mut self, s: &str, n: usize) -> &mut Self {
        let raw = s.as_bytes();
        let len = raw.len().min(n - 1);
        self.b.put_slice(&raw[..len]);
        self.b.put_bytes(0, n - len);
        self
    }

    fn as_bytes(&mut self) -> &[u8] {
        let n = self.b.len() - MGMT_HDR;
        assert_eq!(n as u16 as usize, n, "command too long");
        let s = self.b.as_mut();
        s[4..6].copy_from_slice(&(n as u16).to_le_bytes());
        s
    }
}

/// A parsed event frame.
#[derive(Debug)]
struct Frame {
    code: u16,
    #[allow(dead_code)]
    index: u16,
    params: Bytes,
}

impl Frame {
    fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < MGMT_HDR {
            return Err(Error::InvalidEvent(raw.to_vec()));
        }
        let mut p = Bytes::copy_from_slice(raw);
        let code = p.get_u16_le();
        let index = p.get_u16_le();
        let len = p.get_u16_le();
        if usize::from(len) != p.len() {
            return Err(Error::InvalidEvent(raw.to_vec()));
        }
        Ok(Self {
            code,
            index,
            params: p,
        })
    }
}

/// A command awaiting its `CommandComplete`.
struct PendingCmd {
    opcode: Opcode,
    tx: oneshot::Sender<Result<Bytes>>,
}

/// Management protocol client for one controller.
///
/// Commands are serialized: the server loop is the only issuer, and the
/// kernel answers them in order on this socket.
pub struct Adapter<T> {
    transport: Arc<T>,
    index: u16,
    cmd_timeout: Duration,
    pending: Arc<SyncMutex<Option<PendingCmd>>>,
    desired: Arc<SyncMutex<Settings>>,
    settings: watch::Receiver<Settings>,
    events: Option<mpsc::UnboundedReceiver<DeviceEvent>>,
    shutdown: CancellationToken,
    reader: Option<thread::JoinHandle<()>>,
}

impl<T: Transport> Adapter<T> {
    /// Creates an adapter for controller `index` and starts the reader
    /// thread.
    pub fn new(transport: T, index: u16, cmd_timeout: Duration) -> Self {
        let transport = Arc::new(transport);
        let pending = Arc::new(SyncMutex::new(None));
        let desired = Arc::new(SyncMutex::new(Settings::empty()));
        let (settings_tx, settings) = watch::channel(Settings::empty());
        let (events_tx, events) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let reader = {
            let t = Arc::clone(&transport);
            let pending = Arc::clone(&pending);
            let desired = Arc::clone(&desired);
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("mgmt-reader".into())
                .spawn(move || reader_thread(&*t, &pending, &desired, &settings_tx, &events_tx, &shutdown))
                .expect("failed to spawn mgmt reader")
        };
        Self {
            transport,
            index,
            cmd_timeout,
            pending,
            desired,
            settings,
            events: Some(events),
            shutdown,
            reader: Some(reader),
        }
    }

    /// Takes the device event channel. The server loop consumes it.
    pub fn take_events(&mut self) -> mpsc::UnboundedReceiver<DeviceEvent> {
        self.events.take().expect("device events already taken")
    }

    /// Returns the last settings reported by the controller.
    #[must_use]
    pub fn settings(&self) -> Settings {
        *self.settings.borrow()
    }

    /// Executes a command and returns its `CommandComplete` parameters.
    async fn exec(&self, opcode: Opcode, f: impl FnOnce(&mut Cmd)) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        {
            let mut p = self.pending.lock();
            assert!(p.is_none(), "concurrent mgmt command");
            *p = Some(PendingCmd { opcode, tx });
        }
        let mut cmd = Cmd::new(opcode, self.index);
        f(&mut cmd);
        trace!("Command: {:02X?}", cmd.as_bytes());
        if let Err(e) = self.transport.write_cmd(cmd.as_bytes()) {
            self.pending.lock().take();
            error!("Failed to submit {opcode} command: {e}");
            return Err(e.into());
        }
        match tokio::time::timeout(self.cmd_timeout, rx).await {
            Ok(Ok(r)) => r,
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                self.pending.lock().take();
                error!("{opcode} command timed out");
                Err(Error::CommandTimeout { opcode })
            }
        }
    }

    /// Executes a mode-setting command and returns the new settings.
    async fn set_mode(&self, opcode: Opcode, f: impl FnOnce(&mut Cmd)) -> Result<Settings> {
        let mut p = self.exec(opcode, f).await?;
        if p.len() < 4 {
            return Err(Error::InvalidEvent(p.to_vec()));
        }
        let settings = Settings::from_bits_truncate(p.get_u32_le());
        *self.desired.lock() = settings;
        Ok(settings)
    }

    /// Reads static controller information and the current settings.
    pub async fn read_controller_info(&self) -> Result<ControllerInfo> {
        let info = ControllerInfo::parse(self.exec(Opcode::ReadControllerInfo, |_| {}).await?)?;
        *self.desired.lock() = info.current;
        Ok(info)
    }

    pub async fn set_powered(&self, on: bool) -> Result<Settings> {
        self.set_mode(Opcode::SetPowered, |c| {
            c.u8(on.into());
        })
        .await
    }

    pub async fn set_bredr(&self, on: bool) -> Result<Settings> {
        self.set_mode(Opcode::SetBrEdr, |c| {
            c.u8(on.into());
        })
        .await
    }

    pub async fn set_le(&self, on: bool) -> Result<Settings> {
        self.set_mode(Opcode::SetLowEnergy, |c| {
            c.u8(on.into());
        })
        .await
    }

    pub async fn set_connectable(&self, on: bool) -> Result<Settings> {
        self.set_mode(Opcode::SetConnectable, |c| {
            c.u8(on.into());
        })
        .await
    }

    pub async fn set_bondable(&self, on: bool) -> Result<Settings> {
        self.set_mode(Opcode::SetBondable, |c| {
            c.u8(on.into());
        })
        .await
    }

    /// Sets the discoverable mode. A zero timeout keeps the mode until
    /// changed.
    pub async fn set_discoverable(&self, mode: Discoverable, timeout: u16) -> Result<Settings> {
        self.set_mode(Opcode::SetDiscoverable, |c| {
            c.u8(mode.into()).u16(timeout);
        })
        .await
    }

    pub async fn set_advertising(&self, mode: Advertising) -> Result<Settings> {
        self.set_mode(Opcode::SetAdvertising, |c| {
            c.u8(mode.into());
        })
        .await
    }

    /// Sets the controller's long and short names.
    pub async fn set_local_name(&self, name: &str, short_name: &str) -> Result<()> {
        self.exec(Opcode::SetLocalName, |c| {
            c.name(name, 249).name(short_name, 11);
        })
        .await
        .map(|_| ())
    }

    /// Runs the power-up sequence: read controller state, reconfigure while
    /// powered off (the kernel forbids changing several settings while
    /// powered), then power on advertising-ready. Returns the pre-existing
    /// controller info for later restoration.
    pub async fn power_up(
        &self,
        name: &str,
        short_name: &str,
        bondable: bool,
    ) -> Result<ControllerInfo> {
        let info = self.read_controller_info().await?;
        debug!(
            "Controller {} (ver {}, settings {:?})",
            info.address, info.version, info.current
        );
        if !info.supported.contains(Settings::LE) {
            return Err(Error::Init("controller does not support LE"));
        }
        self.set_powered(false).await?;
        if info.supported.contains(Settings::BREDR) {
            self.set_bredr(false).await?;
        }
        self.set_le(true).await?;
        self.set_bondable(bondable).await?;
        self.set_connectable(true).await?;
        self.set_discoverable(Discoverable::General, 0).await?;
        self.set_local_name(name, short_name).await?;
        self.set_advertising(Advertising::Connectable).await?;
        let s = self.set_powered(true).await?;
        debug!("Controller powered, settings {s:?}");
        Ok(info)
    }

    /// Reverses only what this process set: advertising off, original name
    /// restored best-effort. The controller is left powered for other users.
    pub async fn teardown(&self, original: &ControllerInfo) {
        if let Err(e) = self.set_advertising(Advertising::Off).await {
            warn!("Failed to disable advertising: {e}");
        }
        if let Err(e) = (self.set_local_name(&original.name, &original.short_name)).await {
            warn!("Failed to restore controller name: {e}");
        }
    }
}

impl<T> Drop for Adapter<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(h) = self.reader.take() {
            let _ = h.join();
        }
    }
}

impl<T> Debug for Adapter<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("index", &self.index)
            .field("settings", &*self.settings.borrow())
            .finish()
    }
}

/// Receives frames until shutdown or a fatal transport error, routing each
/// to the pending command waiter or the event channels.
fn reader_thread(
    t: &dyn Transport,
    pending: &SyncMutex<Option<PendingCmd>>,
    desired: &SyncMutex<Settings>,
    settings_tx: &watch::Sender<Settings>,
    events_tx: &mpsc::UnboundedSender<DeviceEvent>,
    shutdown: &CancellationToken,
) {
    debug!("mgmt reader thread started");
    let mut buf = vec![0; 2048];
    while !shutdown.is_cancelled() {
        let n = match t.read_event(&mut buf) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(e) => {
                if !shutdown.is_cancelled() {
                    error!("mgmt read failed: {e}");
                }
                break;
            }
        };
        trace!("Event: {:02X?}", &buf[..n]);
        let frame = match Frame::parse(&buf[..n]) {
            Ok(f) => f,
            Err(e) => {
                warn!("Discarding mgmt frame: {e}");
                continue;
            }
        };
        route(frame, pending, desired, settings_tx, events_tx, shutdown);
    }
    // Fail any waiter so shutdown does not wait out the command timeout.
    if let Some(p) = pending.lock().take() {
        let _ = p.tx.send(Err(Error::Closed));
    }
    debug!("mgmt reader thread terminating");
}

fn route(
    frame: Frame,
    pending: &SyncMutex<Option<PendingCmd>>,
    desired: &SyncMutex<Settings>,
    settings_tx: &watch::Sender<Settings>,
    events_tx: &mpsc::UnboundedSender<DeviceEvent>,
    shutdown: &CancellationToken,
) {
    let mut p = frame.params;
    let code = match EventCode::try_from(frame.code) {
        Ok(code) => code,
        Err(_) => {
            debug!("Unknown mgmt event {:#06X}: {:02X?}", frame.code, p.as_ref());
            return;
        }
    };
    match code {
        EventCode::CommandComplete | EventCode::CommandStatus => {
            if p.len() < 3 {
                warn!("Short {code} event");
                return;
            }
            let opcode = Opcode::from(p.get_u16_le());
            let status = Status::from(p.get_u8());
            let mut guard = pending.lock();
            if !matches!(*guard, Some(ref pc) if pc.opcode == opcode) {
                debug!("Ignored {code} for {opcode}");
                return;
            }
            // CommandStatus reports failures only; a success here still
            // awaits the CommandComplete.
            if code == EventCode::CommandStatus && status.is_ok() {
                return;
            }
            let pc = guard.take().expect("pending command");
            let r = if status.is_ok() {
                Ok(p)
            } else {
                Err(Error::CommandFailed { opcode, status })
            };
            let _ = pc.tx.send(r);
        }
        EventCode::NewSettings => {
            if p.len() < 4 {
                warn!("Short NewSettings event");
                return;
            }
            let settings = Settings::from_bits_truncate(p.get_u32_le());
            let want = *desired.lock();
            if settings != want && !shutdown.is_cancelled() {
                debug!("Settings diverged: have {settings:?}, want {want:?}");
            }
            let _ = settings_tx.send(settings);
        }
        EventCode::DeviceConnected => {
            if p.len() < 6 {
                return;
            }
            let mut addr = [0; 6];
            p.copy_to_slice(&mut addr);
            let _ = events_tx.send(DeviceEvent::Connected(Address(addr)));
        }
        EventCode::DeviceDisconnected => {
            if p.len() < 8 {
                return;
            }
            let mut addr = [0; 6];
            p.copy_to_slice(&mut addr);
            let _typ = p.get_u8();
            let reason = p.get_u8();
            let _ = events_tx.send(DeviceEvent::Disconnected(Address(addr), reason));
        }
        _ => debug!("Ignored mgmt event {code}"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// Loopback transport: records written commands and serves queued or
    /// auto-generated replies.
    #[derive(Debug, Default)]
    struct Loopback {
        /// Reply to every command with a successful CommandComplete carrying
        /// these return parameters.
        auto_params: Option<Vec<u8>>,
        state: SyncMutex<LoopbackState>,
        cond: parking_lot::Condvar,
    }

    #[derive(Debug, Default)]
    struct LoopbackState {
        written: Vec<Vec<u8>>,
        replies: VecDeque<Vec<u8>>,
    }

    impl Loopback {
        fn auto(params: &[u8]) -> Self {
            Self {
                auto_params: Some(params.to_vec()),
                ..Self::default()
            }
        }

        fn written(&self) -> Vec<Vec<u8>> {
            self.state.lock().written.clone()
        }

        fn push_event(&self, frame: &[u8]) {
            self.state.lock().replies.push_back(frame.to_vec());
            self.cond.notify_one();
        }
    }

    impl Transport for Arc<Loopback> {
        fn write_cmd(&self, b: &[u8]) -> std::io::Result<()> {
            let mut st = self.state.lock();
            st.written.push(b.to_vec());
            if let Some(ref params) = self.auto_params {
                let opcode = u16::from_le_bytes([b[0], b[1]]);
                let mut evt = BytesMut::new();
                evt.put_u16_le(EventCode::CommandComplete as u16);
                evt.put_u16_le(0);
                evt.put_u16_le((3 + params.len()) as u16);
                evt.put_u16_le(opcode);
                evt.put_u8(Status::Success.into());
                evt.put_slice(params);
                st.replies.push_back(evt.to_vec());
                self.cond.notify_one();
            }
            Ok(())
        }

        fn read_event(&self, buf: &mut [u8]) -> std::io::Result<usize> {
            let mut st = self.state.lock();
            if st.replies.is_empty() {
                self.cond
                    .wait_for(&mut st, Duration::from_millis(10));
            }
            match st.replies.pop_front() {
                Some(f) => {
                    buf[..f.len()].copy_from_slice(&f);
                    Ok(f.len())
                }
                None => Ok(0),
            }
        }
    }

    fn adapter(lb: &Arc<Loopback>, timeout: Duration) -> Adapter<Arc<Loopback>> {
        Adapter::new(Arc::clone(lb), 0, timeout)
    }

    #[test]
    fn command_encoding() {
        let mut cmd = Cmd::new(Opcode::SetPowered, 0);
        cmd.u8(1);
        assert_eq!(cmd.as_bytes(), [0x05, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01]);

        let mut cmd = Cmd::new(Opcode::SetDiscoverable, 1);
        cmd.u8(1).u16(0);
        assert_eq!(
            cmd.as_bytes(),
            [0x06, 0x00, 0x01, 0x00, 0x03, 0x00, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn name_fields_are_padded_and_bounded() {
        let mut cmd = Cmd::new(Opcode::SetLocalName, 0);
        cmd.name("ab", 4);
        assert_eq!(&cmd.as_bytes()[MGMT_HDR..], [b'a', b'b', 0, 0]);

        let mut cmd = Cmd::new(Opcode::SetLocalName, 0);
        cmd.name("abcdef", 4);
        // Truncated to leave room for the terminating NUL.
        assert_eq!(&cmd.as_bytes()[MGMT_HDR..], [b'a', b'b', b'c', 0]);
    }

    #[test]
    fn frame_parsing() {
        let f = Frame::parse(&[0x06, 0x00, 0x00, 0x00, 0x04, 0x00, 0x01, 0x02, 0x00, 0x00]).unwrap();
        assert_eq!(f.code, 0x0006);
        assert_eq!(f.params.as_ref(), [0x01, 0x02, 0x00, 0x00]);

        assert!(matches!(
            Frame::parse(&[0x06, 0x00, 0x00, 0x00, 0x09, 0x00, 0x01]),
            Err(Error::InvalidEvent(_))
        ));
        assert!(matches!(Frame::parse(&[0x06]), Err(Error::InvalidEvent(_))));
    }

    #[test]
    fn controller_info_parsing() {
        let mut p = BytesMut::new();
        p.put_slice(&[0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        p.put_u8(0x08);
        p.put_u16_le(0x0002);
        p.put_u32_le((Settings::POWERED | Settings::LE | Settings::BREDR).bits());
        p.put_u32_le(Settings::LE.bits());
        p.put_slice(&[0x0C, 0x02, 0x5A]);
        let mut name = [0_u8; 249];
        name[..5].copy_from_slice(b"hello");
        p.put_slice(&name);
        let mut short = [0_u8; 11];
        short[..2].copy_from_slice(b"hi");
        p.put_slice(&short);

        let info = ControllerInfo::parse(p.freeze()).unwrap();
        assert_eq!(info.address.to_string(), "11:22:33:44:55:66");
        assert_eq!(info.version, 8);
        assert_eq!(info.manufacturer, 2);
        assert!(info.supported.contains(Settings::BREDR));
        assert_eq!(info.current, Settings::LE);
        assert_eq!(info.name, "hello");
        assert_eq!(info.short_name, "hi");
    }

    #[tokio::test]
    async fn set_powered_round_trip() {
        let lb = Arc::new(Loopback::auto(
            &(Settings::POWERED | Settings::LE).bits().to_le_bytes(),
        ));
        let adapter = adapter(&lb, Duration::from_secs(1));
        let s = adapter.set_powered(true).await.unwrap();
        assert_eq!(s, Settings::POWERED | Settings::LE);
        let written = lb.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0], [0x05, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01]);
    }

    #[tokio::test]
    async fn unanswered_command_times_out() {
        let lb = Arc::new(Loopback::default());
        let adapter = adapter(&lb, Duration::from_millis(50));
        match adapter.set_powered(true).await {
            Err(Error::CommandTimeout { opcode }) => assert_eq!(opcode, Opcode::SetPowered),
            r => panic!("expected timeout, got {r:?}"),
        }
        // The waiter slot is reusable after a timeout.
        assert!(adapter.pending.lock().is_none());
    }

    #[tokio::test]
    async fn command_failure_status() {
        let lb = Arc::new(Loopback::default());
        let adapter = adapter(&lb, Duration::from_secs(1));
        let mut evt = BytesMut::new();
        evt.put_u16_le(EventCode::CommandComplete as u16);
        evt.put_u16_le(0);
        evt.put_u16_le(3);
        evt.put_u16_le(Opcode::SetLowEnergy.into());
        evt.put_u8(Status::NotSupported.into());
        let task = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            lb.push_event(&evt);
        };
        let (r, ()) = tokio::join!(adapter.set_le(true), task);
        match r {
            Err(Error::CommandFailed { opcode, status }) => {
                assert_eq!(opcode, Opcode::SetLowEnergy);
                assert_eq!(status, Status::NotSupported);
            }
            r => panic!("expected failure, got {r:?}"),
        }
    }

    #[tokio::test]
    async fn new_settings_updates_watch() {
        let lb = Arc::new(Loopback::default());
        let mut adapter = adapter(&lb, Duration::from_secs(1));
        let _events = adapter.take_events();
        let mut evt = BytesMut::new();
        evt.put_u16_le(EventCode::NewSettings as u16);
        evt.put_u16_le(0);
        evt.put_u16_le(4);
        evt.put_u32_le(Settings::ADVERTISING.bits());
        lb.push_event(&evt);
        let mut rx = adapter.settings.clone();
        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .expect("no settings update")
            .unwrap();
        assert_eq!(adapter.settings(), Settings::ADVERTISING);
    }

    #[tokio::test]
    async fn device_events_are_routed() {
        let lb = Arc::new(Loopback::default());
        let mut adapter = adapter(&lb, Duration::from_secs(1));
        let mut events = adapter.take_events();
        let mut evt = BytesMut::new();
        evt.put_u16_le(EventCode::DeviceConnected as u16);
        evt.put_u16_le(0);
        evt.put_u16_le(13);
        evt.put_slice(&[1, 2, 3, 4, 5, 6]);
        evt.put_u8(1); // address type
        evt.put_u32_le(0); // flags
        evt.put_u16_le(0); // EIR length
        lb.push_event(&evt);
        let e = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("no device event")
            .unwrap();
        assert!(matches!(e, DeviceEvent::Connected(a) if a.to_string() == "06:05:04:03:02:01"));
    }
}
