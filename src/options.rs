//! Mount options.
//!
//! Options can be set through the builder methods of `MountOptions` or parsed
//! from the usual comma separated mount option strings, e.g.
//! `"aname=/srv,version=9p2000.L,noatime"`.

use std::time::Duration;

use p9_abi::ProtocolVariant;

use crate::error::{Error, Result};


/// Uid and gid of `nobody`, used when a legacy stat names no numeric owner.
pub const DEFAULT_OWNER: u32 = 65534;

/// Number of drain attempts a forced unmount makes before tearing down anyway.
pub const UNMOUNT_RETRIES: u32 = 10;

/// Pause between two drain attempts of a forced unmount.
pub const UNMOUNT_INTERVAL: Duration = Duration::from_millis(10);


/// Configuration of a mount.
///
/// Use the various methods of this type to configure the mount, then pass it to
/// `MountController::new`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MountOptions {
    pub(crate) source: Option<String>,
    pub(crate) uname: String,
    pub(crate) aname: String,
    pub(crate) variant: ProtocolVariant,
    pub(crate) default_uid: u32,
    pub(crate) default_gid: u32,
    pub(crate) noatime: bool,
    pub(crate) debug: u32,
    pub(crate) update: bool,
    pub(crate) unmount_retries: u32,
    pub(crate) unmount_interval: Duration,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            source: None,
            uname: "nobody".to_owned(),
            aname: String::new(),
            variant: ProtocolVariant::DotL,
            default_uid: DEFAULT_OWNER,
            default_gid: DEFAULT_OWNER,
            noatime: false,
            debug: 0,
            update: false,
            unmount_retries: UNMOUNT_RETRIES,
            unmount_interval: UNMOUNT_INTERVAL,
        }
    }
}

impl MountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse mount option strings.
    ///
    /// Each string may hold several comma separated options. Unknown options
    /// are rejected.
    pub fn parse<S: AsRef<str>>(options: &[S]) -> Result<Self> {
        let mut parsed = Self::default();
        for option in options.iter().flat_map(|s| s.as_ref().split(',')) {
            let option = option.trim();
            if !option.is_empty() {
                parsed.apply(option)?;
            }
        }
        Ok(parsed)
    }

    fn apply(&mut self, option: &str) -> Result<()> {
        let (name, value) = match option.find('=') {
            Some(pos) => (&option[..pos], Some(&option[pos + 1..])),
            None => (option, None),
        };
        match (name, value) {
            ("from", Some(v)) | ("trans", Some(v)) => self.source = Some(v.to_owned()),
            ("aname", Some(v)) => self.aname = v.to_owned(),
            ("uname", Some(v)) => self.uname = v.to_owned(),
            ("uid", Some(v)) => self.default_uid = parse_number(option, v)?,
            ("gid", Some(v)) => self.default_gid = parse_number(option, v)?,
            ("version", Some(v)) => {
                self.variant = ProtocolVariant::from_version_string(v)
                    .ok_or_else(|| Error::InvalidOption(option.to_owned()))?
            }
            ("proto", Some("dotl")) => self.variant = ProtocolVariant::DotL,
            ("proto", Some("legacy")) => self.variant = ProtocolVariant::Legacy,
            ("noatime", None) => self.noatime = true,
            ("debug", None) => self.debug = 1,
            ("debug", Some(v)) => self.debug = parse_number(option, v)?,
            ("update", None) | ("remount", None) => self.update = true,
            ("unmount_retries", Some(v)) => self.unmount_retries = parse_number(option, v)?,
            ("unmount_interval_ms", Some(v)) => {
                self.unmount_interval = Duration::from_millis(u64::from(parse_number(option, v)?))
            }
            _ => return Err(Error::InvalidOption(option.to_owned())),
        }
        Ok(())
    }

    /// Set the source (transport tag) of the export.
    pub fn source<S: Into<String>>(mut self, source: S) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the user name to attach as.
    pub fn uname<S: Into<String>>(mut self, uname: S) -> Self {
        self.uname = uname.into();
        self
    }

    /// Set the remote tree to attach.
    pub fn aname<S: Into<String>>(mut self, aname: S) -> Self {
        self.aname = aname.into();
        self
    }

    /// Set the protocol variant.
    pub fn variant(mut self, variant: ProtocolVariant) -> Self {
        self.variant = variant;
        self
    }

    /// Set the owner used when a legacy stat names no numeric owner.
    ///
    /// The uid is also the one sent with `attach`.
    pub fn default_owner(mut self, uid: u32, gid: u32) -> Self {
        self.default_uid = uid;
        self.default_gid = gid;
        self
    }

    /// Do not update access times.
    ///
    /// Recorded for the surrounding filesystem layer; the core never writes
    /// attributes.
    pub fn noatime(mut self, noatime: bool) -> Self {
        self.noatime = noatime;
        self
    }

    pub fn debug(mut self, level: u32) -> Self {
        self.debug = level;
        self
    }

    /// Set how a forced unmount retries.
    ///
    /// A forced unmount makes up to `retries` drain attempts, pausing
    /// `interval` between two of them, before it tears the mount down
    /// regardless of outstanding references.
    pub fn unmount_retry(mut self, retries: u32, interval: Duration) -> Self {
        self.unmount_retries = retries.max(1);
        self.unmount_interval = interval;
        self
    }

    pub fn source_name(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn protocol_variant(&self) -> ProtocolVariant {
        self.variant
    }

    pub fn is_noatime(&self) -> bool {
        self.noatime
    }

    pub fn debug_level(&self) -> u32 {
        self.debug
    }
}

fn parse_number(option: &str, value: &str) -> Result<u32> {
    value.parse().map_err(|_| Error::InvalidOption(option.to_owned()))
}
