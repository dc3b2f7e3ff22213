/// Version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// User agent reported to the vulnerability data services.
pub const DEFAULT_USER_AGENT: &str = concat!("vulnmirror/", env!("CARGO_PKG_VERSION"));
