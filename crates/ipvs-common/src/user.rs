//! Fixed-size payload structures exchanged with the admin client.
//!
//! Integers are little-endian, IPv4 addresses are four octets in network
//! order, names are NUL-padded.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;

/// Width of scheduler and interface name fields, including the NUL.
pub const NAME_LEN: usize = 16;

/// Defense tunable value meaning "leave unchanged".
pub const UNCHANGED: u32 = u32::MAX;

/// Fixed-size little-endian codec.
pub trait Wire: Sized {
    const SIZE: usize;

    fn encode(&self, buf: &mut impl BufMut);

    /// Decode one value. Callers have checked `buf.remaining() >= SIZE`.
    fn decode_unchecked(buf: &mut impl Buf) -> Self;

    fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if buf.remaining() < Self::SIZE {
            return Err(WireError::Truncated {
                need: Self::SIZE,
                have: buf.remaining(),
            });
        }
        Ok(Self::decode_unchecked(buf))
    }

    /// Decode a value that must span exactly `data`.
    fn from_slice(mut data: &[u8]) -> Result<Self, WireError> {
        if data.len() != Self::SIZE {
            return Err(WireError::BadLength {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        Self::decode(&mut data)
    }

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }
}

// ── Field helpers ────────────────────────────────────────────────────

fn put_addr(buf: &mut impl BufMut, addr: Ipv4Addr) {
    buf.put_slice(&addr.octets());
}

fn get_addr(buf: &mut impl Buf) -> Ipv4Addr {
    let mut octets = [0u8; 4];
    buf.copy_to_slice(&mut octets);
    Ipv4Addr::from(octets)
}

fn get_name(buf: &mut impl Buf) -> [u8; NAME_LEN] {
    let mut name = [0u8; NAME_LEN];
    buf.copy_to_slice(&mut name);
    name
}

/// Pack a name into a NUL-terminated fixed field.
pub fn encode_name(name: &str) -> Result<[u8; NAME_LEN], WireError> {
    let raw = name.as_bytes();
    if raw.len() >= NAME_LEN {
        return Err(WireError::NameTooLong {
            len: raw.len(),
            max: NAME_LEN - 1,
        });
    }
    let mut out = [0u8; NAME_LEN];
    out[..raw.len()].copy_from_slice(raw);
    Ok(out)
}

/// Read a NUL-terminated fixed field. A field without a NUL uses all bytes.
pub fn decode_name(field: &[u8; NAME_LEN]) -> Result<String, WireError> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    std::str::from_utf8(&field[..end])
        .map(str::to_owned)
        .map_err(|_| WireError::InvalidName)
}

// ── Service ──────────────────────────────────────────────────────────

/// Service definition and selector carried by set commands.
///
/// Size: 40 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceUser {
    pub protocol: u16,
    pub port: u16,
    pub addr: Ipv4Addr,
    pub fwmark: u32,
    pub sched_name: [u8; NAME_LEN],
    pub flags: u32,
    pub timeout: u32,
    pub netmask: Ipv4Addr,
}

impl Default for ServiceUser {
    fn default() -> Self {
        Self {
            protocol: 0,
            port: 0,
            addr: Ipv4Addr::UNSPECIFIED,
            fwmark: 0,
            sched_name: [0; NAME_LEN],
            flags: 0,
            timeout: 0,
            netmask: Ipv4Addr::UNSPECIFIED,
        }
    }
}

impl ServiceUser {
    /// True when every selector field is zero (used by `Zero` for "all").
    pub fn is_empty_selector(&self) -> bool {
        self.protocol == 0 && self.addr.is_unspecified() && self.port == 0 && self.fwmark == 0
    }
}

impl Wire for ServiceUser {
    const SIZE: usize = 40;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.protocol);
        buf.put_u16_le(self.port);
        put_addr(buf, self.addr);
        buf.put_u32_le(self.fwmark);
        buf.put_slice(&self.sched_name);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.timeout);
        put_addr(buf, self.netmask);
    }

    fn decode_unchecked(buf: &mut impl Buf) -> Self {
        Self {
            protocol: buf.get_u16_le(),
            port: buf.get_u16_le(),
            addr: get_addr(buf),
            fwmark: buf.get_u32_le(),
            sched_name: get_name(buf),
            flags: buf.get_u32_le(),
            timeout: buf.get_u32_le(),
            netmask: get_addr(buf),
        }
    }
}

// ── Destination ──────────────────────────────────────────────────────

/// Destination definition carried after a `ServiceUser` selector.
///
/// Size: 16 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestUser {
    pub addr: Ipv4Addr,
    pub port: u16,
    pub conn_flags: u32,
    pub weight: i32,
}

impl Wire for DestUser {
    const SIZE: usize = 16;

    fn encode(&self, buf: &mut impl BufMut) {
        put_addr(buf, self.addr);
        buf.put_u16_le(self.port);
        buf.put_u16_le(0);
        buf.put_u32_le(self.conn_flags);
        buf.put_i32_le(self.weight);
    }

    fn decode_unchecked(buf: &mut impl Buf) -> Self {
        let addr = get_addr(buf);
        let port = buf.get_u16_le();
        buf.advance(2);
        Self {
            addr,
            port,
            conn_flags: buf.get_u32_le(),
            weight: buf.get_i32_le(),
        }
    }
}

// ── Timeouts / daemon ────────────────────────────────────────────────

/// Connection timeouts in seconds. Zero leaves a value unchanged on set.
///
/// Size: 12 bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeoutsUser {
    pub tcp: u32,
    pub tcp_fin: u32,
    pub udp: u32,
}

impl Wire for TimeoutsUser {
    const SIZE: usize = 12;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.tcp);
        buf.put_u32_le(self.tcp_fin);
        buf.put_u32_le(self.udp);
    }

    fn decode_unchecked(buf: &mut impl Buf) -> Self {
        Self {
            tcp: buf.get_u32_le(),
            tcp_fin: buf.get_u32_le(),
            udp: buf.get_u32_le(),
        }
    }
}

pub const DAEMON_STATE_NONE: i32 = 0;
pub const DAEMON_STATE_MASTER: i32 = 1;
pub const DAEMON_STATE_BACKUP: i32 = 2;

/// Sync daemon request and status entry. `GetDaemon` replies with two
/// entries, master first.
///
/// Size: 24 bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DaemonUser {
    pub state: i32,
    pub mcast_ifn: [u8; NAME_LEN],
    pub syncid: i32,
}

impl Wire for DaemonUser {
    const SIZE: usize = 24;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.state);
        buf.put_slice(&self.mcast_ifn);
        buf.put_i32_le(self.syncid);
    }

    fn decode_unchecked(buf: &mut impl Buf) -> Self {
        Self {
            state: buf.get_i32_le(),
            mcast_ifn: get_name(buf),
            syncid: buf.get_i32_le(),
        }
    }
}

// ── Defense tunables ─────────────────────────────────────────────────

/// Defense tunables for `SetDefense`. `UNCHANGED` skips a field.
///
/// Size: 40 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefenseUser {
    pub drop_entry: u32,
    pub drop_packet: u32,
    pub secure_tcp: u32,
    pub amemthresh: u32,
    pub am_droprate: u32,
    pub cache_bypass: u32,
    pub expire_nodest_conn: u32,
    pub sync_threshold: [u32; 2],
    pub nat_icmp_send: u32,
}

impl Default for DefenseUser {
    fn default() -> Self {
        Self {
            drop_entry: UNCHANGED,
            drop_packet: UNCHANGED,
            secure_tcp: UNCHANGED,
            amemthresh: UNCHANGED,
            am_droprate: UNCHANGED,
            cache_bypass: UNCHANGED,
            expire_nodest_conn: UNCHANGED,
            sync_threshold: [UNCHANGED; 2],
            nat_icmp_send: UNCHANGED,
        }
    }
}

impl Wire for DefenseUser {
    const SIZE: usize = 40;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.drop_entry);
        buf.put_u32_le(self.drop_packet);
        buf.put_u32_le(self.secure_tcp);
        buf.put_u32_le(self.amemthresh);
        buf.put_u32_le(self.am_droprate);
        buf.put_u32_le(self.cache_bypass);
        buf.put_u32_le(self.expire_nodest_conn);
        buf.put_u32_le(self.sync_threshold[0]);
        buf.put_u32_le(self.sync_threshold[1]);
        buf.put_u32_le(self.nat_icmp_send);
    }

    fn decode_unchecked(buf: &mut impl Buf) -> Self {
        Self {
            drop_entry: buf.get_u32_le(),
            drop_packet: buf.get_u32_le(),
            secure_tcp: buf.get_u32_le(),
            amemthresh: buf.get_u32_le(),
            am_droprate: buf.get_u32_le(),
            cache_bypass: buf.get_u32_le(),
            expire_nodest_conn: buf.get_u32_le(),
            sync_threshold: [buf.get_u32_le(), buf.get_u32_le()],
            nat_icmp_send: buf.get_u32_le(),
        }
    }
}

/// Bit set in `DefenseEntry::effective` per control.
pub const EFFECTIVE_DROP_ENTRY: u32 = 1 << 0;
pub const EFFECTIVE_DROP_PACKET: u32 = 1 << 1;
pub const EFFECTIVE_SECURE_TCP: u32 = 1 << 2;

/// Current tunables plus the live drop rate and effective flags.
///
/// Size: 48 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefenseEntry {
    pub tunables: DefenseUser,
    pub drop_rate: u32,
    pub effective: u32,
}

impl Wire for DefenseEntry {
    const SIZE: usize = 48;

    fn encode(&self, buf: &mut impl BufMut) {
        self.tunables.encode(buf);
        buf.put_u32_le(self.drop_rate);
        buf.put_u32_le(self.effective);
    }

    fn decode_unchecked(buf: &mut impl Buf) -> Self {
        Self {
            tunables: DefenseUser::decode_unchecked(buf),
            drop_rate: buf.get_u32_le(),
            effective: buf.get_u32_le(),
        }
    }
}

// ── Statistics ───────────────────────────────────────────────────────

/// Counters and estimated rates for a service, destination, or globally.
///
/// Size: 48 bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsUser {
    pub conns: u32,
    pub inpkts: u32,
    pub outpkts: u32,
    pub inbytes: u64,
    pub outbytes: u64,
    pub cps: u32,
    pub inpps: u32,
    pub outpps: u32,
    pub inbps: u32,
    pub outbps: u32,
}

impl Wire for StatsUser {
    const SIZE: usize = 48;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.conns);
        buf.put_u32_le(self.inpkts);
        buf.put_u32_le(self.outpkts);
        buf.put_u64_le(self.inbytes);
        buf.put_u64_le(self.outbytes);
        buf.put_u32_le(self.cps);
        buf.put_u32_le(self.inpps);
        buf.put_u32_le(self.outpps);
        buf.put_u32_le(self.inbps);
        buf.put_u32_le(self.outbps);
    }

    fn decode_unchecked(buf: &mut impl Buf) -> Self {
        Self {
            conns: buf.get_u32_le(),
            inpkts: buf.get_u32_le(),
            outpkts: buf.get_u32_le(),
            inbytes: buf.get_u64_le(),
            outbytes: buf.get_u64_le(),
            cps: buf.get_u32_le(),
            inpps: buf.get_u32_le(),
            outpps: buf.get_u32_le(),
            inbps: buf.get_u32_le(),
            outbps: buf.get_u32_le(),
        }
    }
}

// ── Get replies ──────────────────────────────────────────────────────

/// Reply to `GetInfo`.
///
/// Size: 12 bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InfoReply {
    pub version: u32,
    pub conn_tab_size: u32,
    pub num_services: u32,
}

impl Wire for InfoReply {
    const SIZE: usize = 12;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.conn_tab_size);
        buf.put_u32_le(self.num_services);
    }

    fn decode_unchecked(buf: &mut impl Buf) -> Self {
        Self {
            version: buf.get_u32_le(),
            conn_tab_size: buf.get_u32_le(),
            num_services: buf.get_u32_le(),
        }
    }
}

/// One service as reported by `GetService` / `GetServices`. Also the
/// `GetService` request, where only the key fields are read.
///
/// Size: 92 bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceEntry {
    pub service: ServiceUser,
    pub num_dests: u32,
    pub stats: StatsUser,
}

impl Wire for ServiceEntry {
    const SIZE: usize = 92;

    fn encode(&self, buf: &mut impl BufMut) {
        self.service.encode(buf);
        buf.put_u32_le(self.num_dests);
        self.stats.encode(buf);
    }

    fn decode_unchecked(buf: &mut impl Buf) -> Self {
        Self {
            service: ServiceUser::decode_unchecked(buf),
            num_dests: buf.get_u32_le(),
            stats: StatsUser::decode_unchecked(buf),
        }
    }
}

/// One destination as reported by `GetDests`.
///
/// Size: 72 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestEntry {
    pub addr: Ipv4Addr,
    pub port: u16,
    pub conn_flags: u32,
    pub weight: i32,
    pub active_conns: u32,
    pub inactive_conns: u32,
    pub stats: StatsUser,
}

impl Wire for DestEntry {
    const SIZE: usize = 72;

    fn encode(&self, buf: &mut impl BufMut) {
        put_addr(buf, self.addr);
        buf.put_u16_le(self.port);
        buf.put_u16_le(0);
        buf.put_u32_le(self.conn_flags);
        buf.put_i32_le(self.weight);
        buf.put_u32_le(self.active_conns);
        buf.put_u32_le(self.inactive_conns);
        self.stats.encode(buf);
    }

    fn decode_unchecked(buf: &mut impl Buf) -> Self {
        let addr = get_addr(buf);
        let port = buf.get_u16_le();
        buf.advance(2);
        Self {
            addr,
            port,
            conn_flags: buf.get_u32_le(),
            weight: buf.get_i32_le(),
            active_conns: buf.get_u32_le(),
            inactive_conns: buf.get_u32_le(),
            stats: StatsUser::decode_unchecked(buf),
        }
    }
}

/// Header of a `GetServices` request and reply.
///
/// Size: 4 bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetServicesHeader {
    pub num_services: u32,
}

impl GetServicesHeader {
    /// Reply length a client must declare to receive `n` entries.
    pub fn reply_len(n: usize) -> usize {
        Self::SIZE + n * ServiceEntry::SIZE
    }
}

impl Wire for GetServicesHeader {
    const SIZE: usize = 4;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.num_services);
    }

    fn decode_unchecked(buf: &mut impl Buf) -> Self {
        Self {
            num_services: buf.get_u32_le(),
        }
    }
}

/// Header of a `GetDests` request and reply, naming the service.
///
/// Size: 16 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetDestsHeader {
    pub protocol: u16,
    pub port: u16,
    pub addr: Ipv4Addr,
    pub fwmark: u32,
    pub num_dests: u32,
}

impl GetDestsHeader {
    /// Reply length a client must declare to receive `n` entries.
    pub fn reply_len(n: usize) -> usize {
        Self::SIZE + n * DestEntry::SIZE
    }
}

impl Wire for GetDestsHeader {
    const SIZE: usize = 16;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.protocol);
        buf.put_u16_le(self.port);
        put_addr(buf, self.addr);
        buf.put_u32_le(self.fwmark);
        buf.put_u32_le(self.num_dests);
    }

    fn decode_unchecked(buf: &mut impl Buf) -> Self {
        Self {
            protocol: buf.get_u16_le(),
            port: buf.get_u16_le(),
            addr: get_addr(buf),
            fwmark: buf.get_u32_le(),
            num_dests: buf.get_u32_le(),
        }
    }
}

/// Decode `count` consecutive entries after a header.
pub fn decode_entries<T: Wire>(buf: &mut impl Buf, count: usize) -> Result<Vec<T>, WireError> {
    let need = count.saturating_mul(T::SIZE);
    if buf.remaining() < need {
        return Err(WireError::Truncated {
            need,
            have: buf.remaining(),
        });
    }
    Ok((0..count).map(|_| T::decode_unchecked(buf)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sized<T: Wire>(value: &T) -> usize {
        value.to_bytes().len()
    }

    #[test]
    fn encoded_sizes_match_constants() {
        assert_eq!(sized(&ServiceUser::default()), ServiceUser::SIZE);
        let dest = DestUser {
            addr: Ipv4Addr::new(10, 0, 0, 2),
            port: 8080,
            conn_flags: 0,
            weight: 1,
        };
        assert_eq!(sized(&dest), DestUser::SIZE);
        assert_eq!(sized(&TimeoutsUser::default()), TimeoutsUser::SIZE);
        assert_eq!(sized(&DaemonUser::default()), DaemonUser::SIZE);
        assert_eq!(sized(&DefenseUser::default()), DefenseUser::SIZE);
        assert_eq!(sized(&StatsUser::default()), StatsUser::SIZE);
        assert_eq!(sized(&ServiceEntry::default()), ServiceEntry::SIZE);
        assert_eq!(sized(&InfoReply::default()), InfoReply::SIZE);
        assert_eq!(sized(&GetServicesHeader::default()), GetServicesHeader::SIZE);
    }

    #[test]
    fn service_user_layout() {
        let svc = ServiceUser {
            protocol: 6,
            port: 80,
            addr: Ipv4Addr::new(10, 0, 0, 1),
            fwmark: 0,
            sched_name: encode_name("rr").unwrap(),
            flags: 0,
            timeout: 300,
            netmask: Ipv4Addr::BROADCAST,
        };
        let raw = svc.to_bytes();
        assert_eq!(&raw[0..2], &[6, 0]);
        assert_eq!(&raw[2..4], &[80, 0]);
        assert_eq!(&raw[4..8], &[10, 0, 0, 1]);
        assert_eq!(&raw[12..14], b"rr");
        assert_eq!(raw[14], 0);
        assert_eq!(&raw[32..36], &300u32.to_le_bytes());
        assert_eq!(ServiceUser::from_slice(&raw).unwrap(), svc);
    }

    #[test]
    fn dest_entry_roundtrip_skips_padding() {
        let entry = DestEntry {
            addr: Ipv4Addr::new(192, 168, 1, 7),
            port: 443,
            conn_flags: 0x0083,
            weight: -1,
            active_conns: 5,
            inactive_conns: 2,
            stats: StatsUser {
                conns: 9,
                inbytes: 1 << 40,
                ..StatsUser::default()
            },
        };
        let raw = entry.to_bytes();
        assert_eq!(raw.len(), DestEntry::SIZE);
        assert_eq!(&raw[6..8], &[0, 0]);
        assert_eq!(DestEntry::from_slice(&raw).unwrap(), entry);
    }

    #[test]
    fn decode_rejects_short_input() {
        let raw = [0u8; 10];
        let err = ServiceUser::decode(&mut &raw[..]).unwrap_err();
        assert_eq!(err, WireError::Truncated { need: 40, have: 10 });
    }

    #[test]
    fn from_slice_rejects_trailing_bytes() {
        let raw = [0u8; 13];
        assert!(matches!(
            TimeoutsUser::from_slice(&raw),
            Err(WireError::BadLength {
                expected: 12,
                actual: 13
            })
        ));
    }

    #[test]
    fn names_are_nul_terminated() {
        let field = encode_name("wlc").unwrap();
        assert_eq!(decode_name(&field).unwrap(), "wlc");
        assert!(encode_name("a-very-long-name").is_err());
        assert_eq!(decode_name(&[b'x'; NAME_LEN]).unwrap().len(), NAME_LEN);
        let mut bad = [0u8; NAME_LEN];
        bad[0] = 0xff;
        assert_eq!(decode_name(&bad), Err(WireError::InvalidName));
    }

    #[test]
    fn empty_selector_detection() {
        assert!(ServiceUser::default().is_empty_selector());
        let svc = ServiceUser {
            fwmark: 3,
            ..ServiceUser::default()
        };
        assert!(!svc.is_empty_selector());
    }

    #[test]
    fn reply_lengths() {
        assert_eq!(GetServicesHeader::reply_len(0), 4);
        assert_eq!(GetServicesHeader::reply_len(2), 4 + 2 * 92);
        assert_eq!(GetDestsHeader::reply_len(3), 16 + 3 * 72);
    }

    #[test]
    fn decode_entries_checks_total_length() {
        let mut raw = BytesMut::new();
        ServiceEntry::default().encode(&mut raw);
        let mut view = raw.clone().freeze();
        assert_eq!(decode_entries::<ServiceEntry>(&mut view, 1).unwrap().len(), 1);
        let mut view = raw.freeze();
        assert!(decode_entries::<ServiceEntry>(&mut view, 2).is_err());
    }

    #[test]
    fn defense_default_is_all_unchanged() {
        let d = DefenseUser::default();
        assert_eq!(d.amemthresh, UNCHANGED);
        assert_eq!(d.sync_threshold, [UNCHANGED; 2]);
        let entry = DefenseEntry {
            tunables: d,
            drop_rate: 4,
            effective: EFFECTIVE_DROP_PACKET,
        };
        assert_eq!(DefenseEntry::from_slice(&entry.to_bytes()).unwrap(), entry);
    }
}
