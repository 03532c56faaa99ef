//! Attribute I/O callbacks and their request contexts.
//!
//! Handlers never receive a reference into the tree that owns them; each
//! request context carries the owning node's stable identity (path and UUID)
//! plus a handle to the application [`DataBridge`]. Handlers must return
//! promptly and must not block on I/O; slow work belongs on an application
//! thread, with the result delivered through the notify queue.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::bridge::DataBridge;
use crate::uuid::Uuid;

use super::ReqResult;

/// Read callback. Returns the attribute value as bytes.
pub(crate) type ReadFn = Arc<dyn for<'a> Fn(&ReadReq<'a>) -> ReqResult<Vec<u8>> + Send + Sync>;

/// Write callback. Commits the value carried by the request.
pub(crate) type WriteFn = Arc<dyn for<'a> Fn(&mut WriteReq<'a>) -> ReqResult<()> + Send + Sync>;

/// Update callback. Returns whether a `PropertiesChanged` emission for
/// `Value` is authorized.
pub(crate) type UpdatedFn = Arc<dyn for<'a> Fn(&UpdateReq<'a>) -> bool + Send + Sync>;

/// Remote or synthetic read of an attribute value.
pub struct ReadReq<'a> {
    pub(crate) path: &'a str,
    pub(crate) uuid: Uuid,
    pub(crate) bridge: &'a DataBridge,
}

impl ReadReq<'_> {
    /// Returns the object path of the attribute being read.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &str {
        self.path
    }

    /// Returns the attribute UUID.
    #[inline]
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns the application data bridge.
    #[inline]
    #[must_use]
    pub const fn bridge(&self) -> &DataBridge {
        self.bridge
    }
}

impl Debug for ReadReq<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadReq").field("path", &self.path).finish()
    }
}

/// Remote write of an attribute value.
pub struct WriteReq<'a> {
    pub(crate) path: &'a str,
    pub(crate) uuid: Uuid,
    pub(crate) bridge: &'a DataBridge,
    pub(crate) value: &'a [u8],
    pub(crate) forward: bool,
}

impl<'a> WriteReq<'a> {
    /// Returns the object path of the attribute being written.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &str {
        self.path
    }

    /// Returns the attribute UUID.
    #[inline]
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns the application data bridge.
    #[inline]
    #[must_use]
    pub const fn bridge(&self) -> &DataBridge {
        self.bridge
    }

    /// Returns the value being written.
    #[inline]
    #[must_use]
    pub const fn value(&self) -> &'a [u8] {
        self.value
    }

    /// Returns the written value as UTF-8 text, replacing invalid sequences.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(self.value).into_owned()
    }

    /// Requests that the update path run for this attribute after the write
    /// completes, so that subscribers observe the new value. The method
    /// reply is always sent before the resulting `PropertiesChanged`.
    #[inline]
    pub fn forward_update(&mut self) {
        self.forward = true;
    }
}

impl Debug for WriteReq<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteReq")
            .field("path", &self.path)
            .field("value", &self.value)
            .finish()
    }
}

/// Update-path invocation for an attribute whose backing value changed, or
/// whose periodic event fired.
pub struct UpdateReq<'a> {
    pub(crate) path: &'a str,
    pub(crate) uuid: Uuid,
    pub(crate) bridge: &'a DataBridge,
}

impl UpdateReq<'_> {
    /// Returns the object path of the updated attribute.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &str {
        self.path
    }

    /// Returns the attribute UUID.
    #[inline]
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns the application data bridge.
    #[inline]
    #[must_use]
    pub const fn bridge(&self) -> &DataBridge {
        self.bridge
    }
}

impl Debug for UpdateReq<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateReq").field("path", &self.path).finish()
    }
}
