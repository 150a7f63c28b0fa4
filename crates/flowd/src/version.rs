// Version constants for the flowd crate.

/// Version string for the `flowd` crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name.
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Wire protocol version advertised on every network message.
pub const PROTOCOL_VERSION: u32 = 1;
