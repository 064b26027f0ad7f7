//! Reverse name lookup for connecting peers.
//!
//! The lookup is a blocking `getnameinfo` call, so it runs on tokio's blocking
//! pool and is bounded by a timeout. Any failure yields the literal address.

use std::net::IpAddr;
use std::time::Duration;

use tracing::debug;

/// Resolves `ip` to a host name, falling back to the literal address.
///
/// A zero `timeout` skips the lookup entirely.
pub async fn resolve_display_name(ip: IpAddr, timeout: Duration) -> String {
    if timeout.is_zero() {
        return ip.to_string();
    }

    let lookup = tokio::task::spawn_blocking(move || reverse_lookup(ip));
    match tokio::time::timeout(timeout, lookup).await {
        Ok(Ok(Some(name))) => name,
        Ok(Ok(None)) => ip.to_string(),
        Ok(Err(e)) => {
            debug!(%ip, error = %e, "Reverse lookup task failed");
            ip.to_string()
        }
        Err(_) => {
            debug!(%ip, timeout_ms = timeout.as_millis() as u64, "Reverse lookup timed out");
            ip.to_string()
        }
    }
}

#[cfg(unix)]
fn reverse_lookup(ip: IpAddr) -> Option<String> {
    use std::ffi::CStr;
    use std::mem;

    const HOST_BUF_LEN: usize = 1025;
    let mut host = [0 as libc::c_char; HOST_BUF_LEN];

    let rc = match ip {
        IpAddr::V4(v4) => {
            // SAFETY: sockaddr_in is plain old data; all-zero is a valid value.
            let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
            sa.sin_family = libc::AF_INET as libc::sa_family_t;
            sa.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.octets()),
            };
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
            {
                sa.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
            }
            // SAFETY: `sa` is a valid sockaddr_in for the given length and
            // `host` is a writable buffer of the length passed.
            unsafe {
                libc::getnameinfo(
                    &sa as *const libc::sockaddr_in as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    host.as_mut_ptr(),
                    HOST_BUF_LEN as libc::socklen_t,
                    std::ptr::null_mut(),
                    0,
                    libc::NI_NAMEREQD,
                )
            }
        }
        IpAddr::V6(v6) => {
            // SAFETY: sockaddr_in6 is plain old data; all-zero is a valid value.
            let mut sa: libc::sockaddr_in6 = unsafe { mem::zeroed() };
            sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sa.sin6_addr = libc::in6_addr {
                s6_addr: v6.octets(),
            };
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
            {
                sa.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
            }
            // SAFETY: as above, for sockaddr_in6.
            unsafe {
                libc::getnameinfo(
                    &sa as *const libc::sockaddr_in6 as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                    host.as_mut_ptr(),
                    HOST_BUF_LEN as libc::socklen_t,
                    std::ptr::null_mut(),
                    0,
                    libc::NI_NAMEREQD,
                )
            }
        }
    };

    if rc != 0 {
        return None;
    }

    // SAFETY: getnameinfo succeeded, so `host` holds a NUL-terminated string.
    let name = unsafe { CStr::from_ptr(host.as_ptr()) };
    let name = name.to_str().ok()?.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(not(unix))]
fn reverse_lookup(_ip: IpAddr) -> Option<String> {
    None
}
