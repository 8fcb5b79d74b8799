//! Source side of the upgrade: the legacy configuration file and the
//! legacy metadata snapshot.
//!
//! Nothing in this crate writes to the legacy deployment. The only file it
//! creates is the translated target configuration, next to the legacy one.

pub mod config;
pub mod meta;

pub use config::{
    ConfigError, DEFAULT_BIND_ADDRESS, LegacyConfig, TranslatedConfig, TranslationTarget,
    translate_config, translated_config_path,
};
pub use meta::{
    ContinuousQuery, DatabaseInfo, INTERNAL_DATABASE, LegacyMeta, LegacyMetaError,
    LegacyMetaReader, META_FILENAME, Privilege, RetentionPolicy, UserInfo,
};
