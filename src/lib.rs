//! Userspace BLE GATT peripheral framework for Linux.
//!
//! Applications declare a tree of GATT services, characteristics, and
//! descriptors with attached read/write/update callbacks. The server
//! publishes the tree to BlueZ over D-Bus ([`GattManager1`] contract),
//! configures the local controller for connectable advertising over the
//! kernel [management protocol], and runs a tick loop that drains update
//! notifications into `PropertiesChanged` signals.
//!
//! ```no_run
//! use gabble::{Config, DataBridge, Flags, Value};
//!
//! let bridge = DataBridge::new(
//!     |name| (name == "battery/level").then(|| Value::U8(78)),
//!     |_, _| false,
//! );
//! let ok = gabble::start(Config::new("example"), bridge, |app| {
//!     app.service("battery", "180F", |s| {
//!         s.characteristic("level", "2A19", Flags::READ | Flags::NOTIFY, |c| {
//!             c.on_read(|req| Ok(vec![req.bridge().u8("battery/level", 0)]));
//!             c.on_updated(|_| true);
//!         });
//!     });
//! });
//! assert!(ok);
//! gabble::trigger_shutdown();
//! gabble::wait();
//! ```
//!
//! [`GattManager1`]: https://git.kernel.org/pub/scm/bluetooth/bluez.git/tree/doc/org.bluez.GattManager.rst
//! [management protocol]: https://git.kernel.org/pub/scm/bluetooth/bluez.git/tree/doc/mgmt-api.txt

pub mod bridge;
#[path = "gatt/gatt.rs"]
pub mod gatt;
#[path = "mgmt/mgmt.rs"]
pub mod mgmt;
mod server;
pub mod uuid;
pub mod value;

pub use bridge::DataBridge;
pub use gatt::{Application, Flags, Reject};
pub use server::{
    health, notify_updated_characteristic, notify_updated_descriptor, run_state, start,
    trigger_shutdown, wait, Config, Health, RunState,
};
pub use uuid::Uuid;
pub use value::Value;

/// Synchronous mutex used for shared state that is never held across await
/// points.
pub(crate) type SyncMutex<T> = parking_lot::Mutex<T>;
