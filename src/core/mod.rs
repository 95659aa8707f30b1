// Canonical definitions live here; the crate root re-exports the public surface.
pub(crate) mod context;
pub(crate) mod events;
pub(crate) mod expiring;
pub(crate) mod frame;
pub(crate) mod session;
pub(crate) mod types;
