//! Network interface discovery for multicast joins
//!
//! An interface is eligible when it is up, multicast-capable, neither
//! loopback nor point-to-point, carries an IPv4 address, and its name does
//! not start with an excluded prefix.

use std::io;
use std::net::Ipv4Addr;

use tracing::debug;

/// IPv4 interface eligible for the multicast group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub addr: Ipv4Addr,
}

/// Interface flags relevant to eligibility
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceFlags {
    pub up: bool,
    pub loopback: bool,
    pub multicast: bool,
    pub point_to_point: bool,
}

/// Eligibility check on name and flags
pub fn is_eligible(name: &str, flags: InterfaceFlags, exclude_prefixes: &[String]) -> bool {
    if !flags.up || flags.loopback || !flags.multicast || flags.point_to_point {
        return false;
    }
    !exclude_prefixes
        .iter()
        .any(|prefix| !prefix.is_empty() && name.starts_with(prefix.as_str()))
}

/// Enumerate eligible interfaces, one entry per (name, IPv4 address)
#[cfg(unix)]
pub fn eligible_interfaces(exclude_prefixes: &[String]) -> io::Result<Vec<Interface>> {
    use std::ffi::CStr;

    let mut found = Vec::new();
    let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();

    // SAFETY:
    // - `ifaddrs` is a valid pointer to a null pointer, which getifaddrs will populate
    // - The returned list is freed with freeifaddrs at the end of this function
    let ret = unsafe { libc::getifaddrs(&mut ifaddrs) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut ifa = ifaddrs;
    while !ifa.is_null() {
        // SAFETY:
        // - `ifa` is checked to be non-null in the while condition
        // - The structure remains valid until freeifaddrs is called
        let entry = unsafe { &*ifa };
        ifa = entry.ifa_next;

        if entry.ifa_addr.is_null() {
            continue;
        }
        // SAFETY:
        // - `entry.ifa_addr` is checked non-null above
        // - We only read sa_family to determine the address type
        let family = unsafe { (*entry.ifa_addr).sa_family } as i32;
        if family != libc::AF_INET {
            continue;
        }

        // SAFETY:
        // - `entry.ifa_name` is non-null and NUL-terminated for every getifaddrs entry
        // - Converted to an owned String before the list is freed
        let name = unsafe { CStr::from_ptr(entry.ifa_name) }
            .to_string_lossy()
            .into_owned();

        let raw = entry.ifa_flags as libc::c_int;
        let flags = InterfaceFlags {
            up: raw & libc::IFF_UP != 0,
            loopback: raw & libc::IFF_LOOPBACK != 0,
            multicast: raw & libc::IFF_MULTICAST != 0,
            point_to_point: raw & libc::IFF_POINTOPOINT != 0,
        };
        if !is_eligible(&name, flags, exclude_prefixes) {
            debug!("Skip interface {} ({:?})", name, flags);
            continue;
        }

        let sockaddr_in = entry.ifa_addr as *const libc::sockaddr_in;
        // SAFETY:
        // - sa_family == AF_INET guarantees this is a sockaddr_in structure
        // - The pointer is valid as it comes from getifaddrs
        let ip = unsafe { (*sockaddr_in).sin_addr.s_addr };
        found.push(Interface {
            name,
            addr: Ipv4Addr::from(u32::from_be(ip)),
        });
    }

    // SAFETY:
    // - `ifaddrs` is the pointer returned by getifaddrs and has not been freed
    unsafe { libc::freeifaddrs(ifaddrs) };

    Ok(found)
}

#[cfg(not(unix))]
pub fn eligible_interfaces(_exclude_prefixes: &[String]) -> io::Result<Vec<Interface>> {
    Ok(Vec::new())
}
