use std::fmt;

/// Build metadata baked in by the binary's build script.
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub build_profile: &'static str,
    pub build_features: &'static str,
    pub version: &'static str,
    pub build_timestamp: &'static str,
    pub rust_version: &'static str,
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} build, features: {}, built {} with {})",
            self.version,
            self.build_profile,
            self.build_features,
            self.build_timestamp,
            self.rust_version
        )
    }
}

/// Collects the build environment of the calling crate.
///
/// Expands in the caller, so the `BUILD_*` variables must be emitted by
/// that crate's `build.rs`.
#[macro_export]
macro_rules! build_info {
    () => {
        $crate::version::BuildInfo {
            build_profile: env!("BUILD_PROFILE"),
            build_features: env!("BUILD_FEATURES"),
            version: env!("REPO_VERSION"),
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rust_version: env!("RUST_VERSION"),
        }
    };
}
