//! Observable properties.
//!
//! - [`Notifier`]: observer lists, computed-property invalidation and
//!   batched, ordered delivery. Owns no values.
//! - [`ObservableObject`]: a key/value object with plain, silent and computed
//!   properties on top of a notifier.
//! - [`Observer`]: the statically-typed receiver interface. Closures taking
//!   `&PropertyChange` implement it.
//!
//! All handles are `Rc`-based and single-threaded.

mod notifier;
mod object;
mod observer;

pub use notifier::Notifier;
pub use object::ObservableObject;
pub use observer::{Observer, ObserverId, PropertyChange};
