//! Server lifecycle and event loop.
//!
//! The server is a process-wide singleton. `start` builds and validates the
//! GATT tree, then hands it to a dedicated worker thread that powers the
//! controller, claims the bus name, publishes the tree, and runs the tick
//! loop until shutdown. Application threads interact only through the
//! façade functions in this module.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures_util::StreamExt;
use once_cell::sync::Lazy;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zbus::zvariant::ObjectPath;
use zbus::Connection;

use crate::bridge::DataBridge;
use crate::gatt::object::{self, GattManagerProxy, UpdateTx};
use crate::gatt::Application;
use crate::mgmt::{Adapter, DeviceEvent, MgmtSocket};
use crate::SyncMutex;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct Config {
    name: String,
    short_name: String,
    long_name: String,
    controller_index: u16,
    cmd_timeout: Duration,
    tick: Duration,
    bondable: bool,
}

impl Config {
    /// Creates a configuration for a server named `name`. The name becomes
    /// the owned bus name (`com.<name>`), the root object path
    /// (`/com/<name>`), and, until overridden, the advertised device name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            short_name: name.to_owned(),
            long_name: name.to_owned(),
            controller_index: 0,
            cmd_timeout: Duration::from_secs(30),
            tick: Duration::from_millis(100),
            bondable: true,
        }
    }

    /// Sets the advertised short and long device names.
    #[must_use]
    pub fn advertising_names(mut self, short: &str, long: &str) -> Self {
        self.short_name = short.to_owned();
        self.long_name = long.to_owned();
        self
    }

    /// Selects the controller to configure (default 0).
    #[must_use]
    pub fn controller(mut self, index: u16) -> Self {
        self.controller_index = index;
        self
    }

    /// Bounds every asynchronous initialization step (default 30 s).
    #[must_use]
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.cmd_timeout = timeout;
        self
    }

    /// Sets the loop tick period (default 100 ms).
    #[must_use]
    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Controls whether the controller accepts bonding (default true).
    #[must_use]
    pub fn bondable(mut self, bondable: bool) -> Self {
        self.bondable = bondable;
        self
    }

    fn bus_name(&self) -> String {
        format!("com.{}", self.name)
    }
}

/// Server lifecycle state. Transitions are strictly monotonic within one
/// `start`/`wait` cycle.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd, strum::Display)]
pub enum RunState {
    #[default]
    Uninitialized,
    Initializing,
    Running,
    Stopping,
    Stopped,
}

/// Overall server health.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, strum::Display)]
pub enum Health {
    #[default]
    Ok,
    FailedInit,
    FailedRun,
}

struct Shared {
    state: SyncMutex<Lifecycle>,
    cond: parking_lot::Condvar,
}

#[derive(Default)]
struct Lifecycle {
    run_state: RunState,
    health: Health,
    updates: Option<UpdateTx>,
    shutdown: Option<CancellationToken>,
    worker: Option<thread::JoinHandle<()>>,
}

static SERVER: Lazy<Shared> = Lazy::new(|| Shared {
    state: SyncMutex::new(Lifecycle::default()),
    cond: parking_lot::Condvar::new(),
});

fn set_state(state: RunState) {
    let mut st = SERVER.state.lock();
    if state > st.run_state {
        debug!("Server state: {} -> {state}", st.run_state);
        st.run_state = state;
        SERVER.cond.notify_all();
    }
}

/// Returns the current lifecycle state.
#[must_use]
pub fn run_state() -> RunState {
    SERVER.state.lock().run_state
}

/// Returns the current server health.
#[must_use]
pub fn health() -> Health {
    SERVER.state.lock().health
}

/// Starts the server: builds the tree with `configure`, then brings up the
/// controller and the D-Bus registration on a dedicated worker thread.
///
/// Blocks until the server is running or initialization failed. Returns
/// whether the server reached the running state. Calling `start` while a
/// previous instance has not reached `Stopped` is rejected.
pub fn start(config: Config, bridge: DataBridge, configure: impl FnOnce(&mut Application)) -> bool {
    let (update_tx, update_rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    {
        let mut st = SERVER.state.lock();
        if !matches!(st.run_state, RunState::Uninitialized | RunState::Stopped) {
            warn!("start() rejected: server is {}", st.run_state);
            return false;
        }
        // Reap the worker of a previous, fully stopped run.
        if let Some(h) = st.worker.take() {
            let _ = h.join();
        }
        st.run_state = RunState::Initializing;
        st.health = Health::Ok;
        st.updates = Some(update_tx.clone());
        st.shutdown = Some(shutdown.clone());
        SERVER.cond.notify_all();
    }
    info!("Starting server {:?}", config.name);

    let mut app = Application::new(&config.name, bridge);
    configure(&mut app);
    if let Err(e) = app.validate() {
        error!("Invalid GATT tree: {e}");
        finish(Health::FailedInit);
        return false;
    }

    let worker = thread::Builder::new()
        .name("gabble-server".into())
        .spawn(move || run_server(config, app, shutdown, update_tx, update_rx));
    match worker {
        Ok(h) => SERVER.state.lock().worker = Some(h),
        Err(e) => {
            error!("Failed to spawn server thread: {e}");
            finish(Health::FailedInit);
            return false;
        }
    }

    // Wait for init to succeed or fail.
    let mut st = SERVER.state.lock();
    while st.run_state < RunState::Running {
        SERVER.cond.wait(&mut st);
    }
    st.run_state == RunState::Running && st.health == Health::Ok
}

/// Begins an asynchronous shutdown. Idempotent and non-blocking.
pub fn trigger_shutdown() {
    let st = SERVER.state.lock();
    if let Some(ref token) = st.shutdown {
        token.cancel();
    }
}

/// Blocks until the server is fully stopped. Returns whether it stopped
/// healthy.
pub fn wait() -> bool {
    let worker = SERVER.state.lock().worker.take();
    if let Some(h) = worker {
        let _ = h.join();
    }
    let mut st = SERVER.state.lock();
    while !matches!(st.run_state, RunState::Uninitialized | RunState::Stopped) {
        SERVER.cond.wait(&mut st);
    }
    st.health == Health::Ok
}

/// Queues an update notification for the characteristic at `path`. May be
/// called from any thread; the loop thread emits the resulting
/// `PropertiesChanged` with the then-current value. Returns whether the
/// notification was queued.
pub fn notify_updated_characteristic(path: &str) -> bool {
    send_update(path)
}

/// Queues an update notification for the descriptor at `path`.
pub fn notify_updated_descriptor(path: &str) -> bool {
    send_update(path)
}

fn send_update(path: &str) -> bool {
    let st = SERVER.state.lock();
    match st.updates {
        Some(ref tx) if matches!(st.run_state, RunState::Initializing | RunState::Running) => {
            tx.send(path.to_owned()).is_ok()
        }
        _ => {
            debug!("Dropping update notification for {path}: server is {}", st.run_state);
            false
        }
    }
}

/// Records the final health and marks the server stopped.
fn finish(health: Health) {
    let mut st = SERVER.state.lock();
    st.health = health;
    st.run_state = RunState::Stopped;
    st.updates = None;
    st.shutdown = None;
    SERVER.cond.notify_all();
}

/// Worker thread body: hosts a current-thread runtime for the server task.
fn run_server(
    config: Config,
    app: Application,
    shutdown: CancellationToken,
    update_tx: UpdateTx,
    update_rx: mpsc::UnboundedReceiver<String>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build server runtime: {e}");
            finish(Health::FailedInit);
            return;
        }
    };
    let health = rt.block_on(serve(config, app, shutdown, update_tx, update_rx));
    info!("Server stopped ({health})");
    finish(health);
}

async fn serve(
    config: Config,
    app: Application,
    shutdown: CancellationToken,
    update_tx: UpdateTx,
    mut updates: mpsc::UnboundedReceiver<String>,
) -> Health {
    let app = Arc::new(app);

    // Controller bring-up. BlueZ forbids changing several settings while
    // powered, so the whole sequence runs against a powered-off controller.
    let sock = match MgmtSocket::open() {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to open mgmt channel: {e}");
            return Health::FailedInit;
        }
    };
    let mut adapter = Adapter::new(sock, config.controller_index, config.cmd_timeout);
    let mut device_events = adapter.take_events();
    let original = match (adapter.power_up(&config.long_name, &config.short_name, config.bondable)).await
    {
        Ok(info) => info,
        Err(e) => {
            error!("Controller initialization failed: {e}");
            return Health::FailedInit;
        }
    };

    // Bus connection, name, object tree, BlueZ registration.
    let bus_name = config.bus_name();
    let conn = match connect(&bus_name).await {
        Ok(conn) => conn,
        Err(e) => {
            error!("Failed to claim {bus_name} on the system bus: {e}");
            adapter.teardown(&original).await;
            return Health::FailedInit;
        }
    };
    let name_watch = async {
        zbus::fdo::DBusProxy::new(&conn).await?.receive_name_lost().await
    };
    let mut name_lost = match name_watch.await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to watch bus name ownership: {e}");
            adapter.teardown(&original).await;
            return Health::FailedInit;
        }
    };
    let gm = match register_with_bluez(&conn, &app, &update_tx, config.controller_index).await {
        Ok(gm) => gm,
        Err(e) => {
            error!("GATT registration failed: {e}");
            object::unregister(&conn, &app).await;
            adapter.teardown(&original).await;
            return Health::FailedInit;
        }
    };
    info!(
        "Serving {} services under {}",
        app.services().len(),
        app.base_path()
    );

    let mut health = Health::Ok;
    if shutdown.is_cancelled() {
        debug!("Shutdown requested during initialization");
    } else {
        set_state(RunState::Running);
        let mut tick = tokio::time::interval(config.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut events = TickRegistry::new(app.tick_events());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                _ = tick.tick() => {
                    for path in drain_updates(&mut updates) {
                        run_update(&conn, &app, &path).await;
                    }
                    for path in events.expired() {
                        run_event(&conn, &app, &path).await;
                    }
                }
                Some(e) = device_events.recv() => match e {
                    DeviceEvent::Connected(addr) => info!("Device connected: {addr}"),
                    DeviceEvent::Disconnected(addr, reason) => {
                        info!("Device disconnected: {addr} (reason {reason:#04x})");
                    }
                },
                Some(sig) = name_lost.next() => {
                    if matches!(sig.args(), Ok(args) if args.name.as_str() == bus_name) {
                        error!("Lost ownership of {bus_name}");
                        health = Health::FailedRun;
                        break;
                    }
                }
            }
        }
    }

    set_state(RunState::Stopping);
    if let Ok(root) = ObjectPath::try_from(app.base_path()) {
        if let Err(e) = gm.unregister_application(&root).await {
            warn!("UnregisterApplication failed: {e}");
        }
    }
    object::unregister(&conn, &app).await;
    if let Err(e) = conn.release_name(bus_name.as_str()).await {
        warn!("Failed to release {bus_name}: {e}");
    }
    drop(conn);
    adapter.teardown(&original).await;
    health
}

async fn connect(bus_name: &str) -> zbus::Result<Connection> {
    zbus::connection::Builder::system()?
        .name(bus_name)?
        .build()
        .await
}

async fn register_with_bluez(
    conn: &Connection,
    app: &Arc<Application>,
    updates: &UpdateTx,
    controller_index: u16,
) -> zbus::Result<GattManagerProxy<'static>> {
    object::register(conn, app, updates).await?;
    let gm = GattManagerProxy::builder(conn)
        .path(format!("/org/bluez/hci{controller_index}"))?
        .build()
        .await?;
    let root = ObjectPath::try_from(app.base_path().to_owned())
        .expect("validated root path");
    gm.register_application(&root, HashMap::new()).await?;
    debug!("Application registered with BlueZ");
    Ok(gm)
}

/// Drains the notify queue, coalescing duplicate tokens. Order of first
/// occurrence is preserved.
fn drain_updates(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
    let mut pending = Vec::new();
    while let Ok(path) = rx.try_recv() {
        if !pending.contains(&path) {
            pending.push(path);
        }
    }
    pending
}

/// Runs the update path for the node at `path` and emits `PropertiesChanged`
/// if the node authorizes it.
async fn run_update(conn: &Connection, app: &Application, path: &str) {
    if let Some(chr) = app.find_characteristic(path) {
        if chr.take_update(app.bridge()).is_some() {
            if let Err(e) = object::emit_characteristic_value(conn, path).await {
                warn!("Failed to emit value change for {path}: {e}");
            }
        }
    } else if let Some(desc) = app.find_descriptor(path) {
        if desc.take_update(app.bridge()).is_some() {
            if let Err(e) = object::emit_descriptor_value(conn, path).await {
                warn!("Failed to emit value change for {path}: {e}");
            }
        }
    } else {
        warn!("Update notification for unknown path {path}");
    }
}

/// Fires the periodic event for the characteristic at `path`.
async fn run_event(conn: &Connection, app: &Application, path: &str) {
    if let Some(chr) = app.find_characteristic(path) {
        if chr.take_event(app.bridge()).is_some() {
            if let Err(e) = object::emit_characteristic_value(conn, path).await {
                warn!("Failed to emit value change for {path}: {e}");
            }
        }
    }
}

/// Tracks tick counts for periodic event handlers.
struct TickRegistry {
    entries: Vec<TickEntry>,
}

struct TickEntry {
    path: String,
    period: u32,
    elapsed: u32,
}

impl TickRegistry {
    fn new(events: Vec<(String, u32)>) -> Self {
        Self {
            entries: events
                .into_iter()
                .map(|(path, period)| TickEntry {
                    path,
                    period: period.max(1),
                    elapsed: 0,
                })
                .collect(),
        }
    }

    /// Advances all counters by one tick and returns the paths whose period
    /// expired.
    fn expired(&mut self) -> Vec<String> {
        let mut fired = Vec::new();
        for e in &mut self.entries {
            e.elapsed += 1;
            if e.elapsed >= e.period {
                e.elapsed = 0;
                fired.push(e.path.clone());
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let c = Config::new("gabble");
        assert_eq!(c.bus_name(), "com.gabble");
        assert_eq!(c.controller_index, 0);
        assert_eq!(c.cmd_timeout, Duration::from_secs(30));
        assert_eq!(c.tick, Duration::from_millis(100));
        assert!(c.bondable);

        let c = c
            .advertising_names("Short", "A Long Name")
            .controller(1)
            .command_timeout(Duration::from_secs(1))
            .bondable(false);
        assert_eq!(c.short_name, "Short");
        assert_eq!(c.long_name, "A Long Name");
        assert_eq!(c.controller_index, 1);
        assert!(!c.bondable);
    }

    #[test]
    fn run_states_are_ordered() {
        use RunState::*;
        assert!(Uninitialized < Initializing);
        assert!(Initializing < Running);
        assert!(Running < Stopping);
        assert!(Stopping < Stopped);
    }

    #[test]
    fn tick_registry_periods() {
        let mut reg = TickRegistry::new(vec![
            ("/a".into(), 1),
            ("/b".into(), 3),
            ("/c".into(), 0), // clamped to 1
        ]);
        let mut a = 0;
        let mut b = 0;
        let mut c = 0;
        for _ in 0..10 {
            for p in reg.expired() {
                match p.as_str() {
                    "/a" => a += 1,
                    "/b" => b += 1,
                    "/c" => c += 1,
                    _ => unreachable!(),
                }
            }
        }
        // A period of one fires on every tick.
        assert_eq!(a, 10);
        assert_eq!(b, 3);
        assert_eq!(c, 10);
    }

    #[test]
    fn update_drain_coalesces() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for p in ["/a", "/b", "/a", "/c", "/b"] {
            tx.send(p.to_owned()).unwrap();
        }
        assert_eq!(drain_updates(&mut rx), ["/a", "/b", "/c"]);
        assert_eq!(drain_updates(&mut rx), Vec::<String>::new());
    }
}
