//! Forward Error Correction over shard groups
//!
//! Datagrams are grouped K at a time. Each datagram leaves immediately as a
//! data shard; once the K-th datagram of a group is sent, M parity shards
//! follow. Any K shards of a group rebuild the data shards that never made
//! it.
//!
//! ## Shard format
//!
//! ```text
//! +------+-----------+-------+------------+-----------+
//! | flag | group seq | index | payloadLen |  payload  |
//! +------+-----------+-------+------------+-----------+
//! |  1   |     4     |   1   |     2      | Variable  |
//! +------+-----------+-------+------------+-----------+
//! ```
//!
//! Data shards carry the datagram itself. Parity is computed over each data
//! shard coded as `len(2) ∥ datagram`, zero-padded to the longest member, so
//! a rebuilt shard knows its own length.

pub mod gf256;
pub mod reed_solomon;

pub use reed_solomon::{ErasureCoder, ErasureError, ReedSolomon, MAX_TOTAL_SHARDS};

use crate::crypto::DiscardReason;
use crate::error::{Result, TunnelError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;

/// Shard header length on the wire
pub const SHARD_HEADER_LEN: usize = 8;

/// Length prefix carried inside parity-coded data
pub const LEN_PREFIX: usize = 2;

/// Worst-case bytes the FEC layer adds to a datagram (parity shards)
pub const FEC_OVERHEAD: usize = SHARD_HEADER_LEN + LEN_PREFIX;

pub const FLAG_DATA: u8 = 0xF1;
pub const FLAG_PARITY: u8 = 0xF2;

/// Default number of shard groups kept open by the decoder
pub const DEFAULT_GROUP_WINDOW: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardKind {
    Data,
    Parity,
}

impl ShardKind {
    fn flag(self) -> u8 {
        match self {
            ShardKind::Data => FLAG_DATA,
            ShardKind::Parity => FLAG_PARITY,
        }
    }

    fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            FLAG_DATA => Some(ShardKind::Data),
            FLAG_PARITY => Some(ShardKind::Parity),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardHeader {
    pub kind: ShardKind,
    pub group_seq: u32,
    pub index: u8,
    pub len: u16,
}

impl ShardHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind.flag());
        buf.put_u32(self.group_seq);
        buf.put_u8(self.index);
        buf.put_u16(self.len);
    }

    /// Split a shard into header and payload
    pub fn parse(shard: &[u8]) -> std::result::Result<(Self, &[u8]), DiscardReason> {
        if shard.len() < SHARD_HEADER_LEN {
            return Err(DiscardReason::BadShardHeader);
        }

        let mut header = &shard[..SHARD_HEADER_LEN];
        let kind = ShardKind::from_flag(header.get_u8()).ok_or(DiscardReason::BadShardHeader)?;
        let group_seq = header.get_u32();
        let index = header.get_u8();
        let len = header.get_u16();

        let payload = &shard[SHARD_HEADER_LEN..];
        if payload.len() != len as usize {
            return Err(DiscardReason::BadShardHeader);
        }

        Ok((
            Self {
                kind,
                group_seq,
                index,
                len,
            },
            payload,
        ))
    }
}

/// Signed distance between two wrapping group sequence numbers
fn seq_delta(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

fn frame_shard(header: ShardHeader, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(SHARD_HEADER_LEN + payload.len());
    header.encode(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

/// Splits outgoing datagrams into shard groups
pub struct FecEncoder {
    coder: Arc<dyn ErasureCoder>,
    group_seq: u32,
    /// Length-prefixed data of the group being filled
    pending: Vec<Vec<u8>>,
}

impl FecEncoder {
    pub fn new(coder: Arc<dyn ErasureCoder>) -> Self {
        Self::with_start_seq(coder, 0)
    }

    pub fn with_start_seq(coder: Arc<dyn ErasureCoder>, group_seq: u32) -> Self {
        let capacity = coder.data_shards();
        Self {
            coder,
            group_seq,
            pending: Vec::with_capacity(capacity),
        }
    }

    /// Group the next datagram will join
    pub fn group_seq(&self) -> u32 {
        self.group_seq
    }

    /// Shards to send for `datagram`, in order: the data shard, then the
    /// group's parity shards if this datagram completed the group
    pub fn encode(&mut self, datagram: &[u8]) -> Result<Vec<Bytes>> {
        if datagram.len() + LEN_PREFIX > u16::MAX as usize {
            return Err(TunnelError::PayloadTooLarge {
                size: datagram.len() + FEC_OVERHEAD,
                mtu: u16::MAX as usize,
            });
        }

        let data_shards = self.coder.data_shards();
        let index = self.pending.len();

        let mut out = Vec::with_capacity(1 + self.coder.parity_shards());
        out.push(frame_shard(
            ShardHeader {
                kind: ShardKind::Data,
                group_seq: self.group_seq,
                index: index as u8,
                len: datagram.len() as u16,
            },
            datagram,
        ));

        let mut coded = Vec::with_capacity(LEN_PREFIX + datagram.len());
        coded.put_u16(datagram.len() as u16);
        coded.extend_from_slice(datagram);
        self.pending.push(coded);

        if self.pending.len() == data_shards {
            let width = self.pending.iter().map(Vec::len).max().unwrap_or(LEN_PREFIX);
            for shard in &mut self.pending {
                shard.resize(width, 0);
            }

            let refs: Vec<&[u8]> = self.pending.iter().map(Vec::as_slice).collect();
            let parity = self.coder.encode(&refs)?;
            for (i, payload) in parity.iter().enumerate() {
                out.push(frame_shard(
                    ShardHeader {
                        kind: ShardKind::Parity,
                        group_seq: self.group_seq,
                        index: (data_shards + i) as u8,
                        len: width as u16,
                    },
                    payload,
                ));
            }

            self.pending.clear();
            self.group_seq = self.group_seq.wrapping_add(1);
        }

        Ok(out)
    }
}

/// Decoder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FecStats {
    pub data_shards: u64,
    pub parity_shards: u64,
    /// Data shards rebuilt from parity
    pub recovered: u64,
    /// Groups evicted before every data shard was seen
    pub lost_groups: u64,
}

struct ShardGroup {
    /// Data shards hold the raw datagram, parity shards the coded bytes
    shards: Vec<Option<Vec<u8>>>,
    received: usize,
    parity_len: Option<usize>,
    complete: bool,
}

impl ShardGroup {
    fn new(total: usize) -> Self {
        Self {
            shards: vec![None; total],
            received: 0,
            parity_len: None,
            complete: false,
        }
    }

    fn finish(&mut self) {
        self.complete = true;
        self.shards = Vec::new();
    }
}

/// A shard far outside the window, held until a second one agrees
struct PendingJump {
    group_seq: u32,
    shard: Vec<u8>,
}

/// Collects shards and rebuilds lost data shards
pub struct FecDecoder {
    coder: Arc<dyn ErasureCoder>,
    window: u32,
    groups: HashMap<u32, ShardGroup>,
    newest: Option<u32>,
    /// Set once a second shard lands inside the window of `newest`
    anchored: bool,
    pending_jump: Option<PendingJump>,
    stats: FecStats,
}

impl FecDecoder {
    pub fn new(coder: Arc<dyn ErasureCoder>, window: u32) -> Self {
        Self {
            coder,
            window: window.clamp(1, i32::MAX as u32),
            groups: HashMap::new(),
            newest: None,
            anchored: false,
            pending_jump: None,
            stats: FecStats::default(),
        }
    }

    pub fn stats(&self) -> FecStats {
        self.stats
    }

    /// Groups currently tracked, complete or not
    pub fn open_groups(&self) -> usize {
        self.groups.len()
    }

    /// Feed one shard; returns every datagram it makes available
    ///
    /// A data shard yields its own datagram at once. A shard that brings its
    /// group to K yields every data shard rebuilt from parity.
    ///
    /// A shard whose group lies a full window or more ahead is held back
    /// until a second shard from the same region arrives, so one corrupted
    /// group seq cannot push every live group out of the window.
    pub fn decode(&mut self, shard: &[u8]) -> std::result::Result<Vec<Vec<u8>>, DiscardReason> {
        let (header, payload) = ShardHeader::parse(shard)?;
        self.check_index(&header, payload)?;

        let mut out = Vec::new();
        if let Some(held) = self.advance_window(header.group_seq, shard)? {
            if let Ok((held_header, held_payload)) = ShardHeader::parse(&held) {
                if let Ok(datagrams) = self.insert(held_header, held_payload) {
                    out.extend(datagrams);
                }
            }
        }
        out.extend(self.insert(header, payload)?);
        Ok(out)
    }

    fn check_index(&self, header: &ShardHeader, payload: &[u8]) -> std::result::Result<(), DiscardReason> {
        let data_shards = self.coder.data_shards();
        let index = header.index as usize;
        match header.kind {
            ShardKind::Data if index >= data_shards => Err(DiscardReason::BadShardHeader),
            ShardKind::Parity if index < data_shards || index >= self.coder.total_shards() => {
                Err(DiscardReason::BadShardHeader)
            }
            ShardKind::Parity if payload.len() < LEN_PREFIX => Err(DiscardReason::BadShardHeader),
            _ => Ok(()),
        }
    }

    fn insert(
        &mut self,
        header: ShardHeader,
        payload: &[u8],
    ) -> std::result::Result<Vec<Vec<u8>>, DiscardReason> {
        let data_shards = self.coder.data_shards();
        let total = self.coder.total_shards();
        let index = header.index as usize;
        let group = self
            .groups
            .entry(header.group_seq)
            .or_insert_with(|| ShardGroup::new(total));

        if group.complete || group.shards[index].is_some() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        match header.kind {
            ShardKind::Data => {
                self.stats.data_shards += 1;
                out.push(payload.to_vec());
            }
            ShardKind::Parity => {
                if group.parity_len.map_or(false, |len| len != payload.len()) {
                    return Err(DiscardReason::BadShardHeader);
                }
                group.parity_len = Some(payload.len());
                self.stats.parity_shards += 1;
            }
        }
        group.shards[index] = Some(payload.to_vec());
        group.received += 1;

        if group.received >= data_shards {
            let recovered = Self::rebuild(self.coder.as_ref(), header.group_seq, group);
            self.stats.recovered += recovered.len() as u64;
            out.extend(recovered);
            group.finish();
        }

        Ok(out)
    }

    /// Track the newest group and evict those that fell out of the window
    ///
    /// Returns a previously held shard when `seq` confirms its jump.
    fn advance_window(
        &mut self,
        seq: u32,
        shard: &[u8],
    ) -> std::result::Result<Option<Vec<u8>>, DiscardReason> {
        let newest = match self.newest {
            None => {
                self.newest = Some(seq);
                return Ok(None);
            }
            Some(newest) => newest,
        };

        let window = self.window as i32;
        let delta = seq_delta(seq, newest);
        let far_ahead = delta >= window;
        // Until anchored, `newest` may itself be the corrupted one.
        let far_behind = delta <= -window;

        if !far_ahead && !far_behind {
            self.anchored = true;
            if delta > 0 {
                self.pending_jump = None;
                self.slide_to(seq);
            }
            return Ok(None);
        }
        if far_behind && self.anchored {
            return Err(DiscardReason::StaleShard);
        }

        let confirmed = self.pending_jump.as_ref().and_then(|pending| {
            let d = seq_delta(seq, pending.group_seq);
            (d > -window && d < window).then_some(d)
        });
        let Some(d) = confirmed else {
            self.pending_jump = Some(PendingJump {
                group_seq: seq,
                shard: shard.to_vec(),
            });
            return Err(if far_ahead {
                DiscardReason::FutureShard
            } else {
                DiscardReason::StaleShard
            });
        };

        let Some(held) = self.pending_jump.take() else {
            return Ok(None);
        };
        let target = if d > 0 { seq } else { held.group_seq };
        log::debug!("fec window moves from group {} to {}", newest, target);
        self.anchored = true;
        self.slide_to(target);
        Ok(Some(held.shard))
    }

    /// Make `seq` the newest group, dropping groups outside the window
    fn slide_to(&mut self, seq: u32) {
        self.newest = Some(seq);
        let window = self.window as i32;
        let mut lost = 0;
        self.groups.retain(|&group_seq, group| {
            let age = seq_delta(seq, group_seq);
            let keep = (0..window).contains(&age);
            if !keep && !group.complete {
                log::debug!(
                    "fec group {} evicted with {} shards, data lost",
                    group_seq,
                    group.received
                );
                lost += 1;
            }
            keep
        });
        self.stats.lost_groups += lost;
    }

    /// Rebuild the data shards of a group that reached K shards
    fn rebuild(coder: &dyn ErasureCoder, group_seq: u32, group: &mut ShardGroup) -> Vec<Vec<u8>> {
        let data_shards = coder.data_shards();
        let missing: Vec<usize> = (0..data_shards)
            .filter(|&i| group.shards[i].is_none())
            .collect();
        if missing.is_empty() {
            return Vec::new();
        }

        let width = match group.parity_len {
            Some(width) => width,
            None => return Vec::new(),
        };

        let mut coded: Vec<Option<Vec<u8>>> = Vec::with_capacity(group.shards.len());
        for (i, shard) in group.shards.iter().enumerate() {
            let entry = match shard {
                Some(datagram) if i < data_shards => {
                    if datagram.len() + LEN_PREFIX > width {
                        log::debug!("fec group {}: data shard {} wider than parity", group_seq, i);
                        return Vec::new();
                    }
                    let mut buf = Vec::with_capacity(width);
                    buf.put_u16(datagram.len() as u16);
                    buf.extend_from_slice(datagram);
                    buf.resize(width, 0);
                    Some(buf)
                }
                other => other.clone(),
            };
            coded.push(entry);
        }

        if let Err(e) = coder.reconstruct_data(&mut coded) {
            log::debug!("fec group {}: reconstruction failed: {}", group_seq, e);
            return Vec::new();
        }

        let mut out = Vec::with_capacity(missing.len());
        for i in missing {
            let Some(buf) = coded[i].as_ref() else {
                continue;
            };
            let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
            if LEN_PREFIX + len > buf.len() {
                log::debug!("fec group {}: rebuilt shard {} has bad length", group_seq, i);
                continue;
            }
            out.push(buf[LEN_PREFIX..LEN_PREFIX + len].to_vec());
        }
        out
    }
}
