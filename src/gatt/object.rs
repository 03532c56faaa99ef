//! D-Bus interfaces served for the published tree.
//!
//! Each tree node is registered at its object path with the matching
//! `org.bluez` interface; the root carries `org.freedesktop.DBus.ObjectManager`
//! so BlueZ can enumerate the application. Interface structs hold the shared
//! tree plus the node's stable path, never references into the tree.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue};
use zbus::{interface, proxy, Connection};

use super::model::{Application, Characteristic, Descriptor};
use super::Reject;

/// Sender half of the server's notify queue. Write handlers that request
/// forwarding push the attribute path here; the loop thread drains it.
pub(crate) type UpdateTx = mpsc::UnboundedSender<String>;

/// Proxy for BlueZ's GATT application registry at `/org/bluez/hci<N>`.
#[proxy(
    interface = "org.bluez.GattManager1",
    default_service = "org.bluez",
    assume_defaults = false
)]
pub(crate) trait GattManager {
    fn register_application(
        &self,
        application: &ObjectPath<'_>,
        options: HashMap<String, OwnedValue>,
    ) -> zbus::Result<()>;

    fn unregister_application(&self, application: &ObjectPath<'_>) -> zbus::Result<()>;
}

fn owned_path(p: &str) -> OwnedObjectPath {
    OwnedObjectPath::try_from(p.to_owned()).expect("validated object path")
}

/// Root object implementing `ObjectManager` for the whole tree.
pub(crate) struct RootInterface {
    app: Arc<Application>,
}

#[interface(name = "org.freedesktop.DBus.ObjectManager")]
impl RootInterface {
    fn get_managed_objects(
        &self,
    ) -> HashMap<OwnedObjectPath, HashMap<String, HashMap<String, OwnedValue>>> {
        debug!("GetManagedObjects for {}", self.app.base_path());
        let mut out = HashMap::new();
        for (path, ifaces) in self.app.managed_objects() {
            let mut by_iface = HashMap::new();
            for (iface, props) in ifaces {
                let props = props
                    .into_iter()
                    .map(|(name, v)| (name.to_owned(), v.to_owned_value()))
                    .collect();
                by_iface.insert(iface.to_owned(), props);
            }
            out.insert(owned_path(&path), by_iface);
        }
        out
    }
}

/// `org.bluez.GattService1` for one declared service.
pub(crate) struct ServiceInterface {
    app: Arc<Application>,
    path: String,
}

impl ServiceInterface {
    fn node(&self) -> &super::model::Service {
        (self.app.services().iter())
            .find(|s| s.path() == self.path)
            .expect("published service")
    }
}

#[interface(name = "org.bluez.GattService1")]
impl ServiceInterface {
    #[zbus(property, name = "UUID")]
    fn uuid(&self) -> String {
        self.node().uuid().to_string()
    }

    #[zbus(property)]
    fn primary(&self) -> bool {
        self.node().primary()
    }

    #[zbus(property)]
    fn includes(&self) -> Vec<OwnedObjectPath> {
        self.node().includes().iter().map(|p| owned_path(p)).collect()
    }
}

/// `org.bluez.GattCharacteristic1` for one declared characteristic.
pub(crate) struct CharacteristicInterface {
    app: Arc<Application>,
    path: String,
    updates: UpdateTx,
}

impl CharacteristicInterface {
    fn node(&self) -> &Characteristic {
        (self.app.find_characteristic(&self.path)).expect("published characteristic")
    }
}

#[interface(name = "org.bluez.GattCharacteristic1")]
impl CharacteristicInterface {
    async fn read_value(&self, _options: HashMap<String, OwnedValue>) -> std::result::Result<Vec<u8>, Reject> {
        let r = self.node().read_value(self.app.bridge());
        if let Err(ref e) = r {
            warn!("ReadValue on {} rejected: {e}", self.path);
        }
        r
    }

    /// Writes are serialized per characteristic: `&mut self` holds the
    /// interface write lock until the reply is queued, and forwarded update
    /// emissions ride the notify queue behind the reply.
    async fn write_value(
        &mut self,
        value: Vec<u8>,
        _options: HashMap<String, OwnedValue>,
    ) -> std::result::Result<(), Reject> {
        match self.node().write_value(self.app.bridge(), &value) {
            Ok(forward) => {
                if forward {
                    let _ = self.updates.send(self.path.clone());
                }
                Ok(())
            }
            Err(e) => {
                warn!("WriteValue on {} rejected: {e}", self.path);
                Err(e)
            }
        }
    }

    async fn start_notify(
        &mut self,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> std::result::Result<(), Reject> {
        debug!("StartNotify on {}", self.path);
        if self.node().set_notifying(true) {
            self.notifying_changed(&emitter).await?;
        }
        Ok(())
    }

    async fn stop_notify(
        &mut self,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> std::result::Result<(), Reject> {
        debug!("StopNotify on {}", self.path);
        if self.node().set_notifying(false) {
            self.notifying_changed(&emitter).await?;
        }
        Ok(())
    }

    /// Indication confirmation from the central, relayed by BlueZ.
    async fn confirm(&self) -> std::result::Result<(), Reject> {
        debug!("Confirm on {}", self.path);
        Ok(())
    }

    #[zbus(property, name = "UUID")]
    fn uuid(&self) -> String {
        self.node().uuid().to_string()
    }

    #[zbus(property)]
    fn service(&self) -> OwnedObjectPath {
        owned_path(self.node().service_path())
    }

    #[zbus(property)]
    fn flags(&self) -> Vec<String> {
        self.node().flags().to_strings()
    }

    #[zbus(property)]
    fn value(&self) -> Vec<u8> {
        self.node().cached_value()
    }

    #[zbus(property)]
    fn notifying(&self) -> bool {
        self.node().notifying()
    }
}

/// `org.bluez.GattDescriptor1` for one declared descriptor.
pub(crate) struct DescriptorInterface {
    app: Arc<Application>,
    path: String,
    updates: UpdateTx,
}

impl DescriptorInterface {
    fn node(&self) -> &Descriptor {
        (self.app.find_descriptor(&self.path)).expect("published descriptor")
    }
}

#[interface(name = "org.bluez.GattDescriptor1")]
impl DescriptorInterface {
    async fn read_value(&self, _options: HashMap<String, OwnedValue>) -> std::result::Result<Vec<u8>, Reject> {
        let r = self.node().read_value(self.app.bridge());
        if let Err(ref e) = r {
            warn!("ReadValue on {} rejected: {e}", self.path);
        }
        r
    }

    async fn write_value(
        &mut self,
        value: Vec<u8>,
        _options: HashMap<String, OwnedValue>,
    ) -> std::result::Result<(), Reject> {
        match self.node().write_value(self.app.bridge(), &value) {
            Ok(forward) => {
                if forward {
                    let _ = self.updates.send(self.path.clone());
                }
                Ok(())
            }
            Err(e) => {
                warn!("WriteValue on {} rejected: {e}", self.path);
                Err(e)
            }
        }
    }

    #[zbus(property, name = "UUID")]
    fn uuid(&self) -> String {
        self.node().uuid().to_string()
    }

    #[zbus(property)]
    fn characteristic(&self) -> OwnedObjectPath {
        owned_path(self.node().characteristic_path())
    }

    #[zbus(property)]
    fn value(&self) -> Vec<u8> {
        self.node().cached_value()
    }

    #[zbus(property)]
    fn flags(&self) -> Vec<String> {
        self.node().flags().to_strings()
    }
}

/// Registers the root and every tree node with the connection's object
/// server.
pub(crate) async fn register(
    conn: &Connection,
    app: &Arc<Application>,
    updates: &UpdateTx,
) -> zbus::Result<()> {
    let srv = conn.object_server();
    let root = RootInterface {
        app: Arc::clone(app),
    };
    srv.at(app.base_path(), root).await?;
    for s in app.services() {
        let iface = ServiceInterface {
            app: Arc::clone(app),
            path: s.path().to_owned(),
        };
        srv.at(s.path(), iface).await?;
        for c in s.characteristics() {
            let iface = CharacteristicInterface {
                app: Arc::clone(app),
                path: c.path().to_owned(),
                updates: updates.clone(),
            };
            srv.at(c.path(), iface).await?;
            for d in c.descriptors() {
                let iface = DescriptorInterface {
                    app: Arc::clone(app),
                    path: d.path().to_owned(),
                    updates: updates.clone(),
                };
                srv.at(d.path(), iface).await?;
            }
        }
    }
    debug!("Registered {} objects under {}", app.paths().len() + 1, app.base_path());
    Ok(())
}

/// Removes every registered object. Best-effort; later removals proceed even
/// if earlier ones fail.
pub(crate) async fn unregister(conn: &Connection, app: &Application) {
    let srv = conn.object_server();
    for s in app.services() {
        for c in s.characteristics() {
            for d in c.descriptors() {
                let _ = srv.remove::<DescriptorInterface, _>(d.path()).await;
            }
            let _ = srv.remove::<CharacteristicInterface, _>(c.path()).await;
        }
        let _ = srv.remove::<ServiceInterface, _>(s.path()).await;
    }
    let _ = srv.remove::<RootInterface, _>(app.base_path()).await;
}

/// Emits `PropertiesChanged { Value }` for the characteristic at `path`.
/// The node's cache must already hold the value to publish.
pub(crate) async fn emit_characteristic_value(conn: &Connection, path: &str) -> zbus::Result<()> {
    let iref = (conn.object_server())
        .interface::<_, CharacteristicInterface>(path)
        .await?;
    let result = iref.get().await.value_changed(iref.signal_emitter()).await;
    result
}

/// Emits `PropertiesChanged { Value }` for the descriptor at `path`.
pub(crate) async fn emit_descriptor_value(conn: &Connection, path: &str) -> zbus::Result<()> {
    let iref = (conn.object_server())
        .interface::<_, DescriptorInterface>(path)
        .await?;
    let result = iref.get().await.value_changed(iref.signal_emitter()).await;
    result
}
