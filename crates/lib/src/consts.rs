/// Application name, used for the default cache directory.
pub const APP_NAME: &str = "pkgweave";

/// Width of a fingerprint digest in bytes (SHA-256).
pub const FINGERPRINT_LEN: usize = 32;

/// Number of fingerprint prefix characters shown in log lines.
pub const FINGERPRINT_SHORT_LEN: usize = 12;

/// Cache subdirectory holding committed entries.
pub const ENTRIES_DIR: &str = "entries";

/// Cache subdirectory holding in-progress builds.
pub const STAGING_DIR: &str = "staging";

/// Metadata file written into every committed entry.
pub const ENTRY_FILE: &str = "entry.json";

/// Artifact directory inside an entry.
pub const PACKAGE_DIR: &str = "package";

/// Current on-disk entry format.
pub const ENTRY_FORMAT_VERSION: u32 = 1;

/// Number of independently locked reservation table shards.
pub const RESERVATION_SHARDS: usize = 16;

/// Consumer name reported for requirements declared by the root project.
pub const ROOT_CONSUMER: &str = "root";
