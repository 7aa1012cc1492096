//! Small helpers shared across the lab engine: string tokenizing, size
//! parsing, MAC derivation, and host-side filesystem/network plumbing.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;

// =============================================================================
// String Helpers
// =============================================================================

/// Splits a command line into tokens, honouring single quotes, double
/// quotes, and backslash escapes.
///
/// Node `Cmd`/`Entrypoint` strings are tokenised with this before being
/// lowered into a backend container spec.
pub fn shell_split(input: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => {
                        return Err(Error::Config(format!(
                            "trailing backslash in command {input:?}"
                        )))
                    }
                }
            }
            '\'' | '"' => {
                in_token = true;
                let quote = c;
                let mut closed = false;
                for q in chars.by_ref() {
                    if q == quote {
                        closed = true;
                        break;
                    }
                    current.push(q);
                }
                if !closed {
                    return Err(Error::Config(format!(
                        "unterminated quote in command {input:?}"
                    )));
                }
            }
            _ => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Merges `overrides` over `defaults` into a fresh map.
pub fn merge_string_maps(
    defaults: &HashMap<String, String>,
    overrides: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = defaults.clone();
    for (k, v) in overrides {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

// =============================================================================
// Size Parsing
// =============================================================================

/// Parses a human-readable size such as `"1gb"`, `"512MiB"`, or `"64000"`.
///
/// Decimal suffixes (kb/mb/gb) are powers of 1000, binary suffixes
/// (kib/mib/gib) powers of 1024; a bare number is bytes.
pub fn parse_memory(input: &str) -> Result<u64> {
    let s = input.trim().to_ascii_lowercase();
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num, suffix) = s.split_at(split);
    let value: f64 = num
        .parse()
        .map_err(|_| Error::Config(format!("invalid memory limit {input:?}")))?;
    let multiplier: u64 = match suffix.trim() {
        "" | "b" => 1,
        "kb" | "k" => 1000,
        "mb" | "m" => 1000 * 1000,
        "gb" | "g" => 1000 * 1000 * 1000,
        "kib" => 1024,
        "mib" => 1024 * 1024,
        "gib" => 1024 * 1024 * 1024,
        _ => return Err(Error::Config(format!("invalid memory limit {input:?}"))),
    };
    Ok((value * multiplier as f64) as u64)
}

// =============================================================================
// MAC Derivation
// =============================================================================

/// Derives a MAC address with the given vendor OUI and a suffix taken from a
/// hash of `seed`.
///
/// The derivation is stable, so a node keeps its MAC across redeploys of the
/// same lab.
pub fn gen_mac(oui: &str, seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    format!("{}:{:02x}:{:02x}:{:02x}", oui, digest[0], digest[1], digest[2])
}

// =============================================================================
// Filesystem Helpers
// =============================================================================

/// Creates `path` (and parents) with the given mode.
///
/// Lab directories use mode 0777 so vendor images running as non-root users
/// can write into their bind-mounted subdirectories.
pub fn create_directory(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Copies `src` to `dst`, creating the destination's parent directory.
pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(src, dst)?;
    Ok(())
}

// =============================================================================
// Host Network Helpers
// =============================================================================

/// Returns the MTU of the interface carrying the host's default route.
///
/// The management network inherits this when the topology does not pin one.
pub fn default_net_mtu() -> Option<u32> {
    let routes = std::fs::read_to_string("/proc/net/route").ok()?;
    let iface = routes.lines().skip(1).find_map(|line| {
        let mut cols = line.split_whitespace();
        let iface = cols.next()?;
        let dest = cols.next()?;
        (dest == "00000000").then(|| iface.to_string())
    })?;
    let mtu = std::fs::read_to_string(format!("/sys/class/net/{iface}/mtu")).ok()?;
    mtu.trim().parse().ok()
}

/// Disables hardware TX-checksum offload on `ifname`.
///
/// Without this, routers attached to the management bridge observe corrupted
/// checksums on veth traffic.
pub fn ethtool_tx_off(ifname: &str) -> Result<()> {
    const SIOCETHTOOL: libc::c_ulong = 0x8946;
    const ETHTOOL_STXCSUM: u32 = 0x17;

    #[repr(C)]
    struct EthtoolValue {
        cmd: u32,
        data: u32,
    }

    if ifname.len() >= libc::IFNAMSIZ {
        return Err(Error::Config(format!("interface name too long: {ifname:?}")));
    }

    // SAFETY: ifreq is zero-initialised, the name is NUL-terminated within
    // IFNAMSIZ, and the data pointer stays valid for the ioctl call.
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        let mut value = EthtoolValue {
            cmd: ETHTOOL_STXCSUM,
            data: 0,
        };
        let mut ifr: libc::ifreq = std::mem::zeroed();
        for (dst, src) in ifr.ifr_name.iter_mut().zip(ifname.as_bytes()) {
            *dst = *src as libc::c_char;
        }
        ifr.ifr_ifru.ifru_data = &mut value as *mut EthtoolValue as *mut libc::c_char;

        let rc = libc::ioctl(fd, SIOCETHTOOL, &mut ifr);
        let err = std::io::Error::last_os_error();
        libc::close(fd);
        if rc < 0 {
            return Err(err.into());
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_split_plain() {
        let tokens = shell_split("ip link set dev eth1 up").unwrap();
        assert_eq!(tokens, vec!["ip", "link", "set", "dev", "eth1", "up"]);
    }

    #[test]
    fn test_shell_split_quotes() {
        let tokens =
            shell_split(r#"--trace --connection-mode tc --variant "sr-1""#).unwrap();
        assert_eq!(
            tokens,
            vec!["--trace", "--connection-mode", "tc", "--variant", "sr-1"]
        );
    }

    #[test]
    fn test_shell_split_empty() {
        assert!(shell_split("").unwrap().is_empty());
        assert!(shell_split("   ").unwrap().is_empty());
    }

    #[test]
    fn test_shell_split_unterminated_quote() {
        assert!(shell_split("echo 'oops").is_err());
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("64000").unwrap(), 64000);
        assert_eq!(parse_memory("1kb").unwrap(), 1000);
        assert_eq!(parse_memory("1KiB").unwrap(), 1024);
        assert_eq!(parse_memory("2gb").unwrap(), 2_000_000_000);
        assert_eq!(parse_memory("1.5mb").unwrap(), 1_500_000);
        assert!(parse_memory("1xb").is_err());
        assert!(parse_memory("lots").is_err());
    }

    #[test]
    fn test_gen_mac_stable_and_prefixed() {
        let a = gen_mac("00:1c:73", "lab/node1");
        let b = gen_mac("00:1c:73", "lab/node1");
        let c = gen_mac("00:1c:73", "lab/node2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("00:1c:73:"));
        assert_eq!(a.split(':').count(), 6);
    }

    #[test]
    fn test_merge_string_maps_override_wins() {
        let mut defaults = HashMap::new();
        defaults.insert("A".to_string(), "1".to_string());
        defaults.insert("B".to_string(), "2".to_string());
        let mut overrides = HashMap::new();
        overrides.insert("B".to_string(), "3".to_string());

        let merged = merge_string_maps(&defaults, &overrides);
        assert_eq!(merged["A"], "1");
        assert_eq!(merged["B"], "3");
    }
}
