use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::bridge::DataBridge;
use crate::uuid::{ParseUuidError, Uuid};
use crate::value::Value;
use crate::SyncMutex;

use super::io::{ReadFn, ReadReq, UpdateReq, UpdatedFn, WriteFn, WriteReq};
use super::{Error, Flags, Reject, ReqResult, Result};

pub(crate) const SERVICE_IFACE: &str = "org.bluez.GattService1";
pub(crate) const CHARACTERISTIC_IFACE: &str = "org.bluez.GattCharacteristic1";
pub(crate) const DESCRIPTOR_IFACE: &str = "org.bluez.GattDescriptor1";

/// A UUID captured from application input. Parse failures are kept until
/// validation so that tree construction itself stays infallible.
#[derive(Clone, Debug)]
enum UuidSlot {
    Ok(Uuid),
    Bad { raw: String, err: ParseUuidError },
}

impl UuidSlot {
    fn parse(raw: &str) -> Self {
        match raw.parse() {
            Ok(uuid) => Self::Ok(uuid),
            Err(err) => Self::Bad {
                raw: raw.to_owned(),
                err,
            },
        }
    }

    /// Returns the parsed UUID.
    ///
    /// # Panics
    ///
    /// Panics if the slot holds a parse failure; `Application::validate`
    /// rejects such trees before any accessor runs.
    fn get(&self) -> Uuid {
        match *self {
            Self::Ok(uuid) => uuid,
            Self::Bad { ref raw, .. } => panic!("unvalidated UUID {raw:?}"),
        }
    }

    fn check(&self, name: &str) -> Result<()> {
        match *self {
            Self::Ok(_) => Ok(()),
            Self::Bad { ref raw, err } => Err(Error::InvalidUuid {
                name: name.to_owned(),
                uuid: raw.clone(),
                source: err,
            }),
        }
    }
}

/// The GATT object tree rooted at `/com/<name>`.
///
/// Built once by the application's configure callback, validated, then
/// published. The tree is read-only after publication; runtime state
/// (cached values, subscription flags) lives behind interior mutability so
/// shared references from the D-Bus layer stay cheap.
pub struct Application {
    base: String,
    bridge: DataBridge,
    services: Vec<Service>,
}

impl Application {
    pub(crate) fn new(name: &str, bridge: DataBridge) -> Self {
        Self {
            base: format!("/com/{name}"),
            bridge,
            services: Vec::new(),
        }
    }

    /// Returns the root object path.
    #[inline]
    #[must_use]
    pub fn base_path(&self) -> &str {
        &self.base
    }

    #[inline]
    pub(crate) fn bridge(&self) -> &DataBridge {
        &self.bridge
    }

    /// Declares a primary service and calls `f` to define its
    /// characteristics.
    pub fn service(&mut self, name: &str, uuid: &str, f: impl FnOnce(&mut Service)) {
        let mut svc = Service {
            name: name.to_owned(),
            path: format!("{}/{name}", self.base),
            uuid: UuidSlot::parse(uuid),
            primary: true,
            includes: Vec::new(),
            characteristics: Vec::new(),
        };
        f(&mut svc);
        self.services.push(svc);
    }

    /// Returns all services in declaration order.
    #[inline]
    pub(crate) fn services(&self) -> &[Service] {
        &self.services
    }

    /// Returns the characteristic at `path`, if any.
    pub(crate) fn find_characteristic(&self, path: &str) -> Option<&Characteristic> {
        (self.services.iter())
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.path == path)
    }

    /// Returns the descriptor at `path`, if any.
    pub(crate) fn find_descriptor(&self, path: &str) -> Option<&Descriptor> {
        (self.services.iter())
            .flat_map(|s| s.characteristics.iter())
            .flat_map(|c| c.descriptors.iter())
            .find(|d| d.path == path)
    }

    /// Returns `(path, period)` for every characteristic with a periodic
    /// event handler.
    pub(crate) fn tick_events(&self) -> Vec<(String, u32)> {
        (self.services.iter())
            .flat_map(|s| s.characteristics.iter())
            .filter_map(|c| c.event.as_ref().map(|&(period, _)| (c.path.clone(), period)))
            .collect()
    }

    /// Returns every object path below the root in registration order.
    pub(crate) fn paths(&self) -> Vec<String> {
        let mut v = Vec::new();
        for s in &self.services {
            v.push(s.path.clone());
            for c in &s.characteristics {
                v.push(c.path.clone());
                for d in &c.descriptors {
                    v.push(d.path.clone());
                }
            }
        }
        v
    }

    /// Checks the whole tree against the publication invariants.
    pub(crate) fn validate(&self) -> Result<()> {
        fn segment_ok(name: &str) -> bool {
            !name.is_empty()
                && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
        }
        fn check_name(name: &str) -> Result<()> {
            if segment_ok(name) {
                Ok(())
            } else {
                Err(Error::InvalidName(name.to_owned()))
            }
        }
        fn check_include(path: &str) -> Result<()> {
            let ok = path.strip_prefix('/')
                .is_some_and(|rest| !rest.is_empty() && rest.split('/').all(segment_ok));
            if ok {
                Ok(())
            } else {
                Err(Error::InvalidIncludePath(path.to_owned()))
            }
        }

        if self.services.is_empty() {
            return Err(Error::EmptyTree);
        }
        let mut seen = std::collections::HashSet::new();
        let mut unique = |path: &str| -> Result<()> {
            if seen.insert(path.to_owned()) {
                Ok(())
            } else {
                Err(Error::DuplicatePath(path.to_owned()))
            }
        };
        for s in &self.services {
            check_name(&s.name)?;
            s.uuid.check(&s.name)?;
            unique(&s.path)?;
            for inc in &s.includes {
                check_include(inc)?;
            }
            for c in &s.characteristics {
                check_name(&c.name)?;
                c.uuid.check(&c.name)?;
                unique(&c.path)?;
                c.check_handlers()?;
                for d in &c.descriptors {
                    check_name(&d.name)?;
                    d.uuid.check(&d.name)?;
                    unique(&d.path)?;
                    d.check_handlers()?;
                }
            }
        }
        Ok(())
    }

    /// Walks the tree depth-first, producing the property maps served by
    /// `ObjectManager.GetManagedObjects`. Property values are captured by
    /// running each read callback with a synthetic request.
    pub(crate) fn managed_objects(&self) -> Vec<(String, ObjectProps)> {
        let mut out = Vec::new();
        for s in &self.services {
            out.push((s.path.clone(), vec![(SERVICE_IFACE, s.properties())]));
            for c in &s.characteristics {
                out.push((
                    c.path.clone(),
                    vec![(CHARACTERISTIC_IFACE, c.properties(&self.bridge))],
                ));
                for d in &c.descriptors {
                    out.push((
                        d.path.clone(),
                        vec![(DESCRIPTOR_IFACE, d.properties(&self.bridge))],
                    ));
                }
            }
        }
        out
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("base", &self.base)
            .field("services", &self.services.len())
            .finish()
    }
}

/// Interface name plus `property name -> value` pairs for one tree node.
pub(crate) type ObjectProps = Vec<(&'static str, Vec<(&'static str, Value)>)>;

/// A declared GATT service.
pub struct Service {
    name: String,
    path: String,
    uuid: UuidSlot,
    primary: bool,
    includes: Vec<String>,
    characteristics: Vec<Characteristic>,
}

impl Service {
    /// Marks the service as secondary.
    pub fn secondary(&mut self) {
        self.primary = false;
    }

    /// References an included service by absolute object path. The relation
    /// is advisory; the path's format is checked at validation, but the
    /// target is neither owned nor resolved.
    pub fn include(&mut self, path: &str) {
        self.includes.push(path.to_owned());
    }

    /// Declares a characteristic and calls `f` to attach handlers and
    /// descriptors.
    pub fn characteristic(
        &mut self,
        name: &str,
        uuid: &str,
        flags: Flags,
        f: impl FnOnce(&mut Characteristic),
    ) {
        let mut chr = Characteristic {
            name: name.to_owned(),
            path: format!("{}/{name}", self.path),
            service_path: self.path.clone(),
            uuid: UuidSlot::parse(uuid),
            flags,
            read: None,
            write: None,
            updated: None,
            event: None,
            cached: SyncMutex::new(Vec::new()),
            notifying: AtomicBool::new(false),
            descriptors: Vec::new(),
        };
        f(&mut chr);
        self.characteristics.push(chr);
    }

    #[inline]
    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub(crate) fn uuid(&self) -> Uuid {
        self.uuid.get()
    }

    #[inline]
    pub(crate) fn primary(&self) -> bool {
        self.primary
    }

    #[inline]
    pub(crate) fn includes(&self) -> &[String] {
        &self.includes
    }

    #[inline]
    pub(crate) fn characteristics(&self) -> &[Characteristic] {
        &self.characteristics
    }

    fn properties(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("UUID", Value::Str(self.uuid().to_string())),
            ("Primary", Value::Bool(self.primary)),
            ("Includes", Value::ObjectPaths(self.includes.clone())),
        ]
    }
}

/// A declared GATT characteristic.
pub struct Characteristic {
    name: String,
    path: String,
    service_path: String,
    uuid: UuidSlot,
    flags: Flags,
    read: Option<ReadFn>,
    write: Option<WriteFn>,
    updated: Option<UpdatedFn>,
    event: Option<(u32, UpdatedFn)>,
    cached: SyncMutex<Vec<u8>>,
    notifying: AtomicBool,
    descriptors: Vec<Descriptor>,
}

impl Characteristic {
    /// Attaches the read callback. Must not block on I/O.
    pub fn on_read(
        &mut self,
        f: impl Fn(&ReadReq) -> ReqResult<Vec<u8>> + Send + Sync + 'static,
    ) {
        self.read = Some(std::sync::Arc::new(f));
    }

    /// Attaches the write callback. The callback commits the value; the
    /// method reply is produced by the dispatch layer on success.
    pub fn on_write(
        &mut self,
        f: impl Fn(&mut WriteReq) -> ReqResult<()> + Send + Sync + 'static,
    ) {
        self.write = Some(std::sync::Arc::new(f));
    }

    /// Attaches the update callback, invoked when the application signals
    /// that the backing value changed. Returning true authorizes emission of
    /// `PropertiesChanged` for `Value`.
    pub fn on_updated(&mut self, f: impl Fn(&UpdateReq) -> bool + Send + Sync + 'static) {
        self.updated = Some(std::sync::Arc::new(f));
    }

    /// Attaches a periodic event fired every `period` ticks of the server
    /// loop. Returning true emits the current value to subscribers.
    pub fn on_event(
        &mut self,
        period: u32,
        f: impl Fn(&UpdateReq) -> bool + Send + Sync + 'static,
    ) {
        self.event = Some((period.max(1), std::sync::Arc::new(f)));
    }

    /// Declares a descriptor and calls `f` to attach handlers.
    pub fn descriptor(
        &mut self,
        name: &str,
        uuid: &str,
        flags: Flags,
        f: impl FnOnce(&mut Descriptor),
    ) {
        let mut desc = Descriptor {
            name: name.to_owned(),
            path: format!("{}/{name}", self.path),
            characteristic_path: self.path.clone(),
            uuid: UuidSlot::parse(uuid),
            flags,
            read: None,
            write: None,
            updated: None,
            cached: SyncMutex::new(Vec::new()),
        };
        f(&mut desc);
        self.descriptors.push(desc);
    }

    #[inline]
    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub(crate) fn uuid(&self) -> Uuid {
        self.uuid.get()
    }

    #[inline]
    pub(crate) fn flags(&self) -> Flags {
        self.flags
    }

    #[inline]
    pub(crate) fn service_path(&self) -> &str {
        &self.service_path
    }

    #[inline]
    pub(crate) fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    #[inline]
    pub(crate) fn cached_value(&self) -> Vec<u8> {
        self.cached.lock().clone()
    }

    #[inline]
    pub(crate) fn notifying(&self) -> bool {
        self.notifying.load(Ordering::Relaxed)
    }

    /// Sets the subscription flag, returning whether it changed.
    pub(crate) fn set_notifying(&self, on: bool) -> bool {
        self.notifying.swap(on, Ordering::Relaxed) != on
    }

    /// Serves a remote read. The cached `Value` property tracks the last
    /// value produced.
    pub(crate) fn read_value(&self, bridge: &DataBridge) -> ReqResult<Vec<u8>> {
        let Some(read) = self.read.as_ref() else {
            return Err(Reject::NotSupported);
        };
        let req = ReadReq {
            path: &self.path,
            uuid: self.uuid(),
            bridge,
        };
        let v = read(&req)?;
        *self.cached.lock() = v.clone();
        Ok(v)
    }

    /// Serves a remote write. Returns whether the handler requested the
    /// update path to run afterwards.
    pub(crate) fn write_value(&self, bridge: &DataBridge, value: &[u8]) -> ReqResult<bool> {
        let Some(write) = self.write.as_ref() else {
            return Err(Reject::NotSupported);
        };
        let mut req = WriteReq {
            path: &self.path,
            uuid: self.uuid(),
            bridge,
            value,
            forward: false,
        };
        write(&mut req)?;
        *self.cached.lock() = value.to_vec();
        Ok(req.forward)
    }

    /// Runs the update path: invokes the update callback and, if emission is
    /// authorized, captures the current value into the cache and returns it.
    pub(crate) fn take_update(&self, bridge: &DataBridge) -> Option<Vec<u8>> {
        let updated = self.updated.as_ref()?;
        let req = UpdateReq {
            path: &self.path,
            uuid: self.uuid(),
            bridge,
        };
        updated(&req).then(|| self.snapshot_value(bridge))
    }

    /// Runs the periodic event handler, returning the value to emit if the
    /// handler authorized emission.
    pub(crate) fn take_event(&self, bridge: &DataBridge) -> Option<Vec<u8>> {
        let (_, event) = self.event.as_ref()?;
        let req = UpdateReq {
            path: &self.path,
            uuid: self.uuid(),
            bridge,
        };
        event(&req).then(|| self.snapshot_value(bridge))
    }

    /// Captures the current value with a synthetic read, falling back to the
    /// cache when the handler is absent or fails.
    pub(crate) fn snapshot_value(&self, bridge: &DataBridge) -> Vec<u8> {
        let Some(read) = self.read.as_ref() else {
            return self.cached_value();
        };
        let req = ReadReq {
            path: &self.path,
            uuid: self.uuid(),
            bridge,
        };
        match read(&req) {
            Ok(v) => {
                *self.cached.lock() = v.clone();
                v
            }
            Err(e) => {
                warn!("Read handler for {} failed during capture: {e}", self.path);
                self.cached_value()
            }
        }
    }

    fn check_handlers(&self) -> Result<()> {
        let missing = |what| Error::MissingHandler {
            path: self.path.clone(),
            flags: self.flags,
            what,
        };
        if self.flags.contains(Flags::READ) && self.read.is_none() {
            return Err(missing("a read handler"));
        }
        if self.flags.intersects(Flags::WRITE | Flags::WRITE_WITHOUT_RESPONSE)
            && self.write.is_none()
        {
            return Err(missing("a write handler"));
        }
        if self.flags.intersects(Flags::NOTIFY | Flags::INDICATE)
            && self.updated.is_none()
            && self.event.is_none()
        {
            return Err(missing("an update or event handler"));
        }
        Ok(())
    }

    fn properties(&self, bridge: &DataBridge) -> Vec<(&'static str, Value)> {
        vec![
            ("UUID", Value::Str(self.uuid().to_string())),
            ("Service", Value::ObjectPath(self.service_path.clone())),
            ("Flags", Value::Strings(self.flags.to_strings())),
            ("Value", Value::Bytes(self.snapshot_value(bridge))),
            ("Notifying", Value::Bool(self.notifying())),
        ]
    }
}

/// A declared GATT descriptor.
pub struct Descriptor {
    name: String,
    path: String,
    characteristic_path: String,
    uuid: UuidSlot,
    flags: Flags,
    read: Option<ReadFn>,
    write: Option<WriteFn>,
    updated: Option<UpdatedFn>,
    cached: SyncMutex<Vec<u8>>,
}

impl Descriptor {
    /// Attaches the read callback.
    pub fn on_read(
        &mut self,
        f: impl Fn(&ReadReq) -> ReqResult<Vec<u8>> + Send + Sync + 'static,
    ) {
        self.read = Some(std::sync::Arc::new(f));
    }

    /// Attaches the write callback.
    pub fn on_write(
        &mut self,
        f: impl Fn(&mut WriteReq) -> ReqResult<()> + Send + Sync + 'static,
    ) {
        self.write = Some(std::sync::Arc::new(f));
    }

    /// Attaches the update callback.
    pub fn on_updated(&mut self, f: impl Fn(&UpdateReq) -> bool + Send + Sync + 'static) {
        self.updated = Some(std::sync::Arc::new(f));
    }

    #[inline]
    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub(crate) fn uuid(&self) -> Uuid {
        self.uuid.get()
    }

    #[inline]
    pub(crate) fn flags(&self) -> Flags {
        self.flags
    }

    #[inline]
    pub(crate) fn characteristic_path(&self) -> &str {
        &self.characteristic_path
    }

    #[inline]
    pub(crate) fn cached_value(&self) -> Vec<u8> {
        self.cached.lock().clone()
    }

    pub(crate) fn read_value(&self, bridge: &DataBridge) -> ReqResult<Vec<u8>> {
        let Some(read) = self.read.as_ref() else {
            return Err(Reject::NotSupported);
        };
        let req = ReadReq {
            path: &self.path,
            uuid: self.uuid(),
            bridge,
        };
        let v = read(&req)?;
        *self.cached.lock() = v.clone();
        Ok(v)
    }

    pub(crate) fn write_value(&self, bridge: &DataBridge, value: &[u8]) -> ReqResult<bool> {
        let Some(write) = self.write.as_ref() else {
            return Err(Reject::NotSupported);
        };
        let mut req = WriteReq {
            path: &self.path,
            uuid: self.uuid(),
            bridge,
            value,
            forward: false,
        };
        write(&mut req)?;
        *self.cached.lock() = value.to_vec();
        Ok(req.forward)
    }

    pub(crate) fn take_update(&self, bridge: &DataBridge) -> Option<Vec<u8>> {
        let updated = self.updated.as_ref()?;
        let req = UpdateReq {
            path: &self.path,
            uuid: self.uuid(),
            bridge,
        };
        updated(&req).then(|| self.snapshot_value(bridge))
    }

    pub(crate) fn snapshot_value(&self, bridge: &DataBridge) -> Vec<u8> {
        let Some(read) = self.read.as_ref() else {
            return self.cached_value();
        };
        let req = ReadReq {
            path: &self.path,
            uuid: self.uuid(),
            bridge,
        };
        match read(&req) {
            Ok(v) => {
                *self.cached.lock() = v.clone();
                v
            }
            Err(e) => {
                warn!("Read handler for {} failed during capture: {e}", self.path);
                self.cached_value()
            }
        }
    }

    fn check_handlers(&self) -> Result<()> {
        let missing = |what| Error::MissingHandler {
            path: self.path.clone(),
            flags: self.flags,
            what,
        };
        if self.flags.contains(Flags::READ) && self.read.is_none() {
            return Err(missing("a read handler"));
        }
        if self.flags.intersects(Flags::WRITE | Flags::WRITE_WITHOUT_RESPONSE)
            && self.write.is_none()
        {
            return Err(missing("a write handler"));
        }
        Ok(())
    }

    fn properties(&self, bridge: &DataBridge) -> Vec<(&'static str, Value)> {
        vec![
            ("UUID", Value::Str(self.uuid().to_string())),
            (
                "Characteristic",
                Value::ObjectPath(self.characteristic_path.clone()),
            ),
            ("Value", Value::Bytes(self.snapshot_value(bridge))),
            ("Flags", Value::Strings(self.flags.to_strings())),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncMutex;
    use std::sync::Arc;

    fn bridge() -> DataBridge {
        let level = Arc::new(SyncMutex::new(78_u8));
        let text = Arc::new(SyncMutex::new(String::from("Hello, world!")));
        let get = {
            let (level, text) = (Arc::clone(&level), Arc::clone(&text));
            move |name: &str| match name {
                "battery/level" => Some(Value::U8(*level.lock())),
                "text/string" => Some(Value::Str(text.lock().clone())),
                _ => None,
            }
        };
        let set = move |name: &str, v: Value| match name {
            "battery/level" => match v {
                Value::U8(x) => {
                    *level.lock() = x;
                    true
                }
                _ => false,
            },
            "text/string" => match v.into_bytes() {
                Some(b) => {
                    *text.lock() = String::from_utf8_lossy(&b).into_owned();
                    true
                }
                None => false,
            },
            _ => false,
        };
        DataBridge::new(get, set)
    }

    fn demo_app() -> Application {
        let mut app = Application::new("gabble", bridge());
        app.service("device", "180A", |s| {
            s.characteristic("mfgr_name", "2A29", Flags::READ, |c| {
                c.on_read(|_| Ok(b"Acme Inc.".to_vec()));
            });
        });
        app.service("battery", "180F", |s| {
            s.characteristic("level", "2A19", Flags::READ | Flags::NOTIFY, |c| {
                c.on_read(|req| Ok(vec![req.bridge().u8("battery/level", 0)]));
                c.on_updated(|_| true);
            });
        });
        app.service("text", "00000001-1E3C-FAD4-74E2-97A033F1BFAA", |s| {
            s.characteristic(
                "string",
                "00000002-1E3C-FAD4-74E2-97A033F1BFAA",
                Flags::READ | Flags::WRITE | Flags::NOTIFY,
                |c| {
                    c.on_read(|req| Ok(req.bridge().bytes("text/string", b"")));
                    c.on_write(|req| {
                        if !req.bridge().set("text/string", req.value().to_vec()) {
                            return Err(Reject::failed("rejected"));
                        }
                        req.forward_update();
                        Ok(())
                    });
                    c.on_updated(|_| true);
                    c.descriptor("description", "2901", Flags::READ, |d| {
                        d.on_read(|_| Ok(b"A mutable text string".to_vec()));
                    });
                },
            );
        });
        app
    }

    #[test]
    fn paths_follow_tree_shape() {
        let app = demo_app();
        assert_eq!(app.base_path(), "/com/gabble");
        assert_eq!(
            app.paths(),
            [
                "/com/gabble/device",
                "/com/gabble/device/mfgr_name",
                "/com/gabble/battery",
                "/com/gabble/battery/level",
                "/com/gabble/text",
                "/com/gabble/text/string",
                "/com/gabble/text/string/description",
            ]
        );
        assert!(app.validate().is_ok());
    }

    #[test]
    fn managed_objects_cover_declared_interfaces() {
        let app = demo_app();
        let objs = app.managed_objects();
        assert_eq!(objs.len(), app.paths().len());
        for (path, ifaces) in &objs {
            let depth = path.matches('/').count() - app.base_path().matches('/').count();
            let want = match depth {
                1 => SERVICE_IFACE,
                2 => CHARACTERISTIC_IFACE,
                3 => DESCRIPTOR_IFACE,
                _ => panic!("unexpected path {path}"),
            };
            assert_eq!(ifaces.len(), 1, "{path}");
            assert_eq!(ifaces[0].0, want, "{path}");
        }

        // Device Information manufacturer string (S1 shape).
        let (_, ifaces) = (objs.iter())
            .find(|(p, _)| p == "/com/gabble/device/mfgr_name")
            .unwrap();
        let props = &ifaces[0].1;
        let value = props.iter().find(|(n, _)| *n == "Value").unwrap();
        assert_eq!(
            value.1,
            Value::Bytes(vec![0x41, 0x63, 0x6d, 0x65, 0x20, 0x49, 0x6e, 0x63, 0x2e])
        );
        let uuid = props.iter().find(|(n, _)| *n == "UUID").unwrap();
        assert_eq!(
            uuid.1,
            Value::Str("00002a29-0000-1000-8000-00805f9b34fb".into())
        );
    }

    #[test]
    fn update_path_emits_current_value() {
        let app = demo_app();
        let chr = app.find_characteristic("/com/gabble/battery/level").unwrap();
        assert_eq!(chr.take_update(app.bridge()), Some(vec![78]));
        assert!(app.bridge().set("battery/level", 77_u8));
        assert_eq!(chr.take_update(app.bridge()), Some(vec![0x4D]));
        assert_eq!(chr.cached_value(), vec![0x4D]);
    }

    #[test]
    fn write_round_trip_forwards_update() {
        let app = demo_app();
        let chr = app.find_characteristic("/com/gabble/text/string").unwrap();
        let forward = chr.write_value(app.bridge(), &[0x48, 0x69]).unwrap();
        assert!(forward);
        assert_eq!(chr.read_value(app.bridge()).unwrap(), vec![0x48, 0x69]);
        assert_eq!(chr.take_update(app.bridge()), Some(vec![0x48, 0x69]));
    }

    #[test]
    fn unknown_bridge_key_surfaces_as_rejection() {
        let mut app = Application::new("gabble", bridge());
        app.service("bogus", "B001", |s| {
            s.characteristic("missing", "B002", Flags::READ, |c| {
                c.on_read(|req| {
                    (req.bridge().get("does/not/exist"))
                        .and_then(Value::into_bytes)
                        .ok_or_else(|| Reject::failed("unknown"))
                });
            });
        });
        assert!(app.validate().is_ok());
        let chr = app.find_characteristic("/com/gabble/bogus/missing").unwrap();
        assert!(matches!(
            chr.read_value(app.bridge()),
            Err(Reject::Failed(_))
        ));
        // A failed capture falls back to the (empty) cache.
        assert_eq!(chr.snapshot_value(app.bridge()), Vec::<u8>::new());
    }

    #[test]
    fn validation_rejects_misdeclared_trees() {
        let mut app = Application::new("gabble", bridge());
        assert_eq!(app.validate(), Err(Error::EmptyTree));

        app.service("device", "180A", |s| {
            s.characteristic("level", "2A19", Flags::READ | Flags::NOTIFY, |c| {
                c.on_read(|_| Ok(Vec::new()));
            });
        });
        assert!(matches!(
            app.validate(),
            Err(Error::MissingHandler { what: "an update or event handler", .. })
        ));

        let mut app = Application::new("gabble", bridge());
        app.service("device", "not-a-uuid", |s| {
            s.characteristic("x", "2A19", Flags::empty(), |_| {});
        });
        assert!(matches!(app.validate(), Err(Error::InvalidUuid { .. })));

        let mut app = Application::new("gabble", bridge());
        app.service("device", "180A", |_| {});
        app.service("device", "180F", |_| {});
        assert_eq!(
            app.validate(),
            Err(Error::DuplicatePath("/com/gabble/device".into()))
        );

        let mut app = Application::new("gabble", bridge());
        app.service("bad name", "180A", |_| {});
        assert_eq!(app.validate(), Err(Error::InvalidName("bad name".into())));

        // Write-without-response needs a write handler just like write does.
        let mut app = Application::new("gabble", bridge());
        app.service("text", "180A", |s| {
            s.characteristic("string", "2A3D", Flags::WRITE_WITHOUT_RESPONSE, |c| {
                c.descriptor("trigger", "2906", Flags::WRITE_WITHOUT_RESPONSE, |_| {});
                c.on_write(|_| Ok(()));
            });
        });
        assert!(matches!(
            app.validate(),
            Err(Error::MissingHandler { what: "a write handler", .. })
        ));
    }

    #[test]
    fn include_paths_are_validated() {
        fn app_with_include(path: &'static str) -> Application {
            let mut app = Application::new("gabble", bridge());
            app.service("device", "180A", |s| {
                s.include(path);
            });
            app
        }

        assert!(app_with_include("/com/gabble/battery").validate().is_ok());
        for bad in ["battery", "", "/", "/com/gabble/", "/com/bad name", "//x"] {
            assert_eq!(
                app_with_include(bad).validate(),
                Err(Error::InvalidIncludePath(bad.into())),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn event_registry() {
        let mut app = Application::new("gabble", bridge());
        app.service("time", "1805", |s| {
            s.characteristic("current", "2A2B", Flags::READ | Flags::NOTIFY, |c| {
                c.on_read(|_| Ok(vec![0]));
                c.on_event(1, |_| true);
            });
        });
        assert_eq!(app.tick_events(), [("/com/gabble/time/current".into(), 1)]);
        let chr = app.find_characteristic("/com/gabble/time/current").unwrap();
        assert_eq!(chr.take_event(app.bridge()), Some(vec![0]));
        assert!(chr.take_update(app.bridge()).is_none());
    }
}
