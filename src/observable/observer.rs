use serde_json::Value;

/// A single property change delivered to observers.
///
/// `new` is `None` for computed properties: they are recomputed lazily on
/// the next read, so the new value is not known when the change fires.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    pub key: String,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

impl PropertyChange {
    pub fn new(key: impl Into<String>, old: Option<Value>, new: Option<Value>) -> Self {
        PropertyChange {
            key: key.into(),
            old,
            new,
        }
    }
}

/// Receiver of property change notifications.
pub trait Observer {
    fn property_did_change(&self, change: &PropertyChange);
}

impl<F> Observer for F
where
    F: Fn(&PropertyChange),
{
    fn property_did_change(&self, change: &PropertyChange) {
        self(change)
    }
}

/// Handle returned by `observe`, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(pub(crate) u64);
