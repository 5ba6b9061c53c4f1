//! Address families and RFC 8305 candidate ordering.

use std::{cmp::Reverse, fmt, net::IpAddr};

/// The address family of a candidate IP address.
///
/// The discriminants match the conventional family numbers, which also makes
/// IPv6 sort before IPv4 when ordering by family descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// IPv4, including IPv4-mapped IPv6 addresses (`::ffff:0:0/96`).
    V4 = 4,
    /// IPv6.
    V6 = 6,
}

impl Family {
    /// Classifies an address.
    ///
    /// An IPv6 address with a valid 4-byte representation (IPv4-mapped,
    /// `::ffff:a.b.c.d`) is classified as [`Family::V4`]: it reaches an IPv4
    /// endpoint, so it belongs in the IPv4 half of the attempt schedule.
    pub fn of(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(v6) if v6.to_ipv4_mapped().is_some() => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => f.write_str("IPv4"),
            Family::V6 => f.write_str("IPv6"),
        }
    }
}

/// Alternates addresses between families, IPv6 slots first.
///
/// The input is partitioned into an IPv6 and an IPv4 subsequence, each
/// preserving input order, and the output takes one address from each in
/// turn until one family drains; the remainder of the other family follows
/// in order. Interleaving keeps either stack from starving the other of
/// attempt slots, per RFC 8305 §4.
pub fn interleave(ips: &[IpAddr]) -> Vec<IpAddr> {
    let mut v6 = Vec::new();
    let mut v4 = Vec::new();
    for &ip in ips {
        match Family::of(ip) {
            Family::V6 => v6.push(ip),
            Family::V4 => v4.push(ip),
        }
    }

    let mut out = Vec::with_capacity(ips.len());
    let mut v6 = v6.into_iter();
    let mut v4 = v4.into_iter();
    loop {
        match (v6.next(), v4.next()) {
            (None, None) => break,
            (six, four) => {
                out.extend(six);
                out.extend(four);
            }
        }
    }
    out
}

/// Stably sorts addresses by family, IPv6 first, then [`interleave`]s them.
///
/// A lone IPv4 address followed by a lone IPv6 address therefore comes out
/// as `[IPv6, IPv4]`. Within a family, input order is preserved.
pub fn sort_and_interleave(ips: &[IpAddr]) -> Vec<IpAddr> {
    let mut sorted = ips.to_vec();
    // Stable sort: runs of same-family addresses keep their input order.
    sorted.sort_by_key(|&ip| Reverse(Family::of(ip) as u8));
    interleave(&sorted)
}
