//! Host fingerprint used to bind the encrypted database file to one machine.
//!
//! Identifiers are probed best-effort in a fixed order; every non-empty value is
//! folded together with OS platform and architecture and hashed with SHA-256.
//! An explicit seed replaces probing entirely. When nothing can be probed a
//! low-entropy fallback keeps the store available and is flagged as such.

use sha2::{Digest, Sha256};
use std::io;
use std::sync::OnceLock;
use sysinfo::{Networks, System};

/// Minimum length of an override seed.
pub const MIN_SEED_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintSource {
    Override,
    Hardware,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// SHA-256 digest, lowercase hex
    pub digest: String,
    pub source: FingerprintSource,
    /// Number of identifiers that contributed (0 for override and fallback)
    pub identifiers: usize,
}

impl Fingerprint {
    pub fn digest_bytes(&self) -> Vec<u8> {
        hex::decode(&self.digest).unwrap_or_else(|_| self.digest.as_bytes().to_vec())
    }

    pub fn is_fallback(&self) -> bool {
        self.source == FingerprintSource::Fallback
    }
}

/// One best-effort identifier source. A probe returns `Ok(None)` when the
/// identifier does not exist on this platform.
#[derive(Clone, Copy)]
pub struct Probe {
    pub name: &'static str,
    pub run: fn() -> io::Result<Option<String>>,
}

impl std::fmt::Debug for Probe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Probe").field("name", &self.name).finish()
    }
}

/// Ranked default probes: platform UUID, board serial, CPU, disk serials, MACs.
pub fn default_probes() -> Vec<Probe> {
    vec![
        Probe { name: "machine_uuid", run: probe_machine_uuid },
        Probe { name: "board_serial", run: probe_board_serial },
        Probe { name: "cpu", run: probe_cpu },
        Probe { name: "disk_serial", run: probe_disk_serials },
        Probe { name: "mac", run: probe_mac_addresses },
    ]
}

#[derive(Debug)]
pub struct HardwareFingerprint {
    seed: Option<String>,
    probes: Vec<Probe>,
    cache: OnceLock<Fingerprint>,
}

impl HardwareFingerprint {
    pub fn new(seed: Option<String>) -> Self {
        Self::with_probes(seed, default_probes())
    }

    pub fn with_probes(seed: Option<String>, probes: Vec<Probe>) -> Self {
        Self {
            seed,
            probes,
            cache: OnceLock::new(),
        }
    }

    /// Computed once per instance; later calls return the cached value.
    pub fn generate(&self) -> Fingerprint {
        self.cache.get_or_init(|| self.compute()).clone()
    }

    /// Recompute-or-cache and compare against a stored digest.
    pub fn validate(&self, expected: &str) -> bool {
        self.generate().digest.eq_ignore_ascii_case(expected.trim())
    }

    fn compute(&self) -> Fingerprint {
        if let Some(seed) = self.seed.as_deref() {
            if seed.len() >= MIN_SEED_LEN {
                tracing::info!("hardware fingerprint taken from override seed");
                return Fingerprint {
                    digest: sha256_hex(seed.as_bytes()),
                    source: FingerprintSource::Override,
                    identifiers: 0,
                };
            }
            tracing::warn!(
                len = seed.len(),
                min = MIN_SEED_LEN,
                "fingerprint seed too short; probing hardware instead"
            );
        }

        let mut parts = Vec::new();
        for probe in &self.probes {
            match (probe.run)() {
                Ok(Some(value)) if !value.trim().is_empty() => {
                    parts.push(format!("{}:{}", probe.name, value.trim()));
                }
                Ok(_) => tracing::debug!(probe = probe.name, "identifier unavailable"),
                Err(e) => tracing::debug!(probe = probe.name, error = %e, "probe failed"),
            }
        }

        if parts.is_empty() {
            tracing::warn!("no hardware identifiers found; using low-entropy fallback fingerprint");
            let cwd = std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            let material = format!(
                "fallback|host:{}|platform:{}|arch:{}|cwd:{}",
                System::host_name().unwrap_or_default(),
                std::env::consts::OS,
                std::env::consts::ARCH,
                cwd
            );
            return Fingerprint {
                digest: sha256_hex(material.as_bytes()),
                source: FingerprintSource::Fallback,
                identifiers: 0,
            };
        }

        let identifiers = parts.len();
        parts.push(format!("platform:{}", std::env::consts::OS));
        parts.push(format!("arch:{}", std::env::consts::ARCH));
        Fingerprint {
            digest: sha256_hex(parts.join("|").as_bytes()),
            source: FingerprintSource::Hardware,
            identifiers,
        }
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(data);
    format!("{:x}", h.finalize())
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn read_trimmed(path: &str) -> io::Result<Option<String>> {
    let value = std::fs::read_to_string(path)?;
    let value = value.trim();
    // DMI placeholders seen on cheap boards and some hypervisors
    let junk = ["", "None", "Not Specified", "To be filled by O.E.M.", "Default string", "0"];
    if junk.contains(&value) {
        return Ok(None);
    }
    Ok(Some(value.to_string()))
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn first_available(paths: &[&str]) -> io::Result<Option<String>> {
    let mut last_err = None;
    for path in paths {
        match read_trimmed(path) {
            Ok(Some(v)) => return Ok(Some(v)),
            Ok(None) => {}
            Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) => Err(e),
        None => Ok(None),
    }
}

/// Run a command and return the first output line that is not a header.
#[cfg(any(target_os = "windows", target_os = "macos"))]
fn command_value(program: &str, args: &[&str], filter: impl Fn(&str) -> Option<String>) -> io::Result<Option<String>> {
    let out = std::process::Command::new(program).args(args).output()?;
    if !out.status.success() {
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&out.stdout);
    Ok(text.lines().find_map(|l| filter(l.trim())))
}

fn probe_machine_uuid() -> io::Result<Option<String>> {
    #[cfg(target_os = "linux")]
    {
        first_available(&[
            "/sys/class/dmi/id/product_uuid",
            "/etc/machine-id",
            "/var/lib/dbus/machine-id",
        ])
    }
    #[cfg(target_os = "macos")]
    {
        command_value("ioreg", &["-rd1", "-c", "IOPlatformExpertDevice"], |l| {
            l.contains("IOPlatformUUID")
                .then(|| l.rsplit('"').nth(1).map(str::to_string))
                .flatten()
        })
    }
    #[cfg(target_os = "windows")]
    {
        command_value("wmic", &["csproduct", "get", "uuid"], |l| {
            (!l.is_empty() && !l.eq_ignore_ascii_case("uuid")).then(|| l.to_string())
        })
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        Ok(None)
    }
}

fn probe_board_serial() -> io::Result<Option<String>> {
    #[cfg(target_os = "linux")]
    {
        first_available(&["/sys/class/dmi/id/board_serial"])
    }
    #[cfg(target_os = "windows")]
    {
        command_value("wmic", &["baseboard", "get", "serialnumber"], |l| {
            (!l.is_empty() && !l.eq_ignore_ascii_case("serialnumber")).then(|| l.to_string())
        })
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(None)
    }
}

fn probe_cpu() -> io::Result<Option<String>> {
    let mut sys = System::new();
    sys.refresh_cpu();
    let cpu = match sys.cpus().first() {
        Some(c) => c,
        None => return Ok(None),
    };
    let id = format!("{}/{}/{}", cpu.vendor_id(), cpu.brand(), sys.cpus().len());
    Ok(Some(id))
}

fn probe_disk_serials() -> io::Result<Option<String>> {
    #[cfg(target_os = "linux")]
    {
        let mut serials = Vec::new();
        for entry in std::fs::read_dir("/sys/block")? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("zram") {
                continue;
            }
            let serial = entry.path().join("device").join("serial");
            if let Ok(Some(s)) = read_trimmed(&serial.to_string_lossy()) {
                serials.push(s);
            }
        }
        serials.sort();
        Ok((!serials.is_empty()).then(|| serials.join(",")))
    }
    #[cfg(target_os = "windows")]
    {
        command_value("wmic", &["diskdrive", "get", "serialnumber"], |l| {
            (!l.is_empty() && !l.eq_ignore_ascii_case("serialnumber")).then(|| l.to_string())
        })
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(None)
    }
}

/// Interfaces whose MAC changes across reboots or containers.
fn is_unstable_interface(name: &str) -> bool {
    const PREFIXES: [&str; 10] = [
        "lo", "docker", "veth", "br-", "virbr", "vmnet", "vboxnet", "tun", "tap", "utun",
    ];
    PREFIXES.iter().any(|p| name.starts_with(p))
}

fn probe_mac_addresses() -> io::Result<Option<String>> {
    let networks = Networks::new_with_refreshed_list();
    let mut macs: Vec<String> = networks
        .iter()
        .filter(|(name, _)| !is_unstable_interface(name))
        .map(|(_, data)| data.mac_address())
        .filter(|mac| !mac.is_unspecified())
        .map(|mac| mac.to_string())
        .collect();
    macs.sort();
    macs.dedup();
    Ok((!macs.is_empty()).then(|| macs.join(",")))
}
