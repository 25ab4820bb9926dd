//! Device filter and LAN CIDR detection
//!
//! Partitions the live network devices into flow-offload candidates
//! (`auto_devices`) and devices that must bypass the firewall chains instead
//! (`auto_bypass`). The same filter decides which interface addresses count
//! as LAN when no CIDRs are configured.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;

use ipnetwork::Ipv4Network;
use tracing::debug;

use crate::config::{Config, DEFAULT_LAN_CIDRS};
use crate::core::error::{Error, Result};
use crate::utils::{SYSFS_NET, list_interfaces, unique_sorted};

/// One IPv4 address assigned to an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddr {
    pub name: String,
    pub addr: Ipv4Addr,
    pub prefix: u8,
    pub up: bool,
    pub loopback: bool,
}

/// Read-only view of the host's network devices.
pub trait HostInventory {
    /// Raw device directory listing (may include `lo` and hidden entries).
    fn list_devices(&self) -> Result<Vec<String>>;
    /// Every IPv4 address on every interface.
    fn ipv4_addrs(&self) -> Result<Vec<InterfaceAddr>>;
}

/// The running host: sysfs for device names, `getifaddrs(3)` for addresses.
#[derive(Debug, Clone)]
pub struct SysHost {
    root: PathBuf,
}

impl Default for SysHost {
    fn default() -> Self {
        Self::with_root(SYSFS_NET)
    }
}

impl SysHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads device names from `root` instead of `/sys/class/net`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl HostInventory for SysHost {
    fn list_devices(&self) -> Result<Vec<String>> {
        list_interfaces(&self.root).map_err(|source| Error::System {
            op: "list network devices",
            path: self.root.clone(),
            source,
        })
    }

    fn ipv4_addrs(&self) -> Result<Vec<InterfaceAddr>> {
        use nix::ifaddrs::getifaddrs;
        use nix::net::if_::InterfaceFlags;

        let addrs = getifaddrs().map_err(|errno| Error::Syscall {
            call: "getifaddrs",
            source: errno.into(),
        })?;

        let mut out = Vec::new();
        for ifa in addrs {
            let (Some(addr), Some(mask)) = (
                ifa.address.as_ref().and_then(|a| a.as_sockaddr_in()),
                ifa.netmask.as_ref().and_then(|m| m.as_sockaddr_in()),
            ) else {
                continue;
            };
            let addr = *SocketAddrV4::from(*addr).ip();
            let mask = *SocketAddrV4::from(*mask).ip();
            let Ok(prefix) = ipnetwork::ipv4_mask_to_prefix(mask) else {
                debug!("Skipping {} on {}: non-contiguous netmask {mask}", addr, ifa.interface_name);
                continue;
            };
            out.push(InterfaceAddr {
                name: ifa.interface_name.clone(),
                addr,
                prefix,
                up: ifa.flags.contains(InterfaceFlags::IFF_UP),
                loopback: ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK),
            });
        }
        Ok(out)
    }
}

/// Result of partitioning the live devices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSelection {
    pub auto_devices: Vec<String>,
    pub auto_bypass: Vec<String>,
}

/// Loopback and hidden entries only take part in selection when included.
pub fn is_candidate(name: &str) -> bool {
    !name.is_empty() && name != "lo" && !name.starts_with('.')
}

/// The device lists of a [`Config`], trimmed and deduplicated.
///
/// Every name comparison goes through this view, so a padded entry behaves
/// exactly like its trimmed form.
#[derive(Debug, Clone, Default)]
struct DeviceFilter {
    explicit: Vec<String>,
    include: Vec<String>,
    exclude: Vec<String>,
    exclude_prefixes: Vec<String>,
}

impl DeviceFilter {
    fn new(cfg: &Config) -> Self {
        Self {
            explicit: unique_sorted(&cfg.flowtable_device_explicit),
            include: unique_sorted(&cfg.flowtable_device_include),
            exclude: unique_sorted(&cfg.flowtable_device_exclude),
            exclude_prefixes: unique_sorted(&cfg.flowtable_device_exclude_prefixes),
        }
    }

    fn explicit_mode(&self) -> bool {
        !self.explicit.is_empty()
    }

    fn is_explicit(&self, name: &str) -> bool {
        self.explicit.iter().any(|d| d == name)
    }

    fn is_included(&self, name: &str) -> bool {
        self.include.iter().any(|d| d == name)
    }

    /// Filter-mode eligibility. Inclusion overrides every exclusion.
    fn eligible(&self, name: &str) -> bool {
        if self.is_included(name) {
            return true;
        }
        is_candidate(name)
            && !self.exclude.iter().any(|e| e == name)
            && !self
                .exclude_prefixes
                .iter()
                .any(|p| name.starts_with(p.as_str()))
    }

    /// Whether `name` may contribute flow devices or LAN addresses.
    fn allowed(&self, name: &str) -> bool {
        if self.explicit_mode() {
            self.is_explicit(name)
        } else {
            self.eligible(name)
        }
    }

    /// Devices the operator forced in, which skip the operational-state check.
    fn forced(&self, name: &str) -> bool {
        self.is_included(name) || self.is_explicit(name)
    }
}

/// Partitions `live` into offload candidates and bypass devices.
///
/// In explicit mode the candidates are exactly the explicit list and every
/// other live device bypasses. Otherwise each live candidate lands in exactly
/// one of the two lists, and include entries are added to `auto_devices`
/// whether or not they are live.
pub fn detect_devices(cfg: &Config, live: &[String]) -> DeviceSelection {
    let filter = DeviceFilter::new(cfg);
    let live = unique_sorted(live);

    let selection = if filter.explicit_mode() {
        let bypass: Vec<&str> = live
            .iter()
            .map(String::as_str)
            .filter(|n| is_candidate(n) && !filter.is_explicit(n))
            .collect();
        DeviceSelection {
            auto_devices: filter.explicit.clone(),
            auto_bypass: unique_sorted(&bypass),
        }
    } else {
        let (mut devices, bypass): (Vec<&str>, Vec<&str>) = live
            .iter()
            .map(String::as_str)
            .filter(|n| is_candidate(n) || filter.is_included(n))
            .partition(|n| filter.eligible(n));
        devices.extend(filter.include.iter().map(String::as_str));
        DeviceSelection {
            auto_devices: unique_sorted(&devices),
            auto_bypass: unique_sorted(&bypass),
        }
    };

    debug!(
        "Device selection: offload={:?} bypass={:?}",
        selection.auto_devices, selection.auto_bypass
    );
    selection
}

/// Devices the flowtable should hook: the explicit list when set, otherwise
/// the detected candidates.
pub fn flow_devices(cfg: &Config, selection: &DeviceSelection) -> Vec<String> {
    let filter = DeviceFilter::new(cfg);
    if filter.explicit_mode() {
        filter.explicit
    } else {
        selection.auto_devices.clone()
    }
}

/// IPv4 networks of allowed, up, non-loopback interfaces in first-seen order.
pub fn detect_lan_cidrs(cfg: &Config, addrs: &[InterfaceAddr]) -> Vec<String> {
    let filter = DeviceFilter::new(cfg);
    let mut cidrs: Vec<String> = Vec::new();
    for ifa in addrs {
        if ifa.loopback || !filter.allowed(&ifa.name) {
            continue;
        }
        if !ifa.up && !filter.forced(&ifa.name) {
            continue;
        }
        let Ok(net) = Ipv4Network::new(ifa.addr, ifa.prefix) else {
            continue;
        };
        let cidr = format!("{}/{}", net.network(), net.prefix());
        if !cidrs.contains(&cidr) {
            cidrs.push(cidr);
        }
    }
    cidrs
}

/// Picks the LAN CIDRs: configured ones, else detected ones, else the
/// built-in private ranges.
pub fn resolve_lan_cidrs(cfg: &Config, host: &dyn HostInventory) -> Result<Vec<String>> {
    if cfg.lan_cidrs.iter().any(|c| !c.trim().is_empty()) {
        return Ok(cfg.lan_cidrs.clone());
    }
    let detected = detect_lan_cidrs(cfg, &host.ipv4_addrs()?);
    if detected.is_empty() {
        debug!("No LAN addresses detected, using built-in ranges");
        return Ok(DEFAULT_LAN_CIDRS.iter().map(|c| (*c).to_string()).collect());
    }
    debug!("Detected LAN CIDRs: {detected:?}");
    Ok(detected)
}
