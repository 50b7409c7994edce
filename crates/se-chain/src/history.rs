// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Replayable binary chain history.
//!
//! The sampler appends one record per step to a bounded in-memory ring,
//! flushed to disk as self-delimited segments. A segment is an INITIALISE
//! record — the full live multiset plus cached scalars — followed by DELTA
//! records, one per proposal, accepted or not. After a parallel-tempering
//! swap or a resample the ring is flushed and re-initialised from the new
//! base state, so back-to-back INITIALISE records are legal input.
//!
//! Wire framing: every record is a 1-byte type tag, a little-endian `u32`
//! payload length, then the payload. EOF is only legal on a tag boundary.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use se_core::error::{CoreError, CoreResult};

const TAG_INITIALISE: u8 = 0;
const TAG_DELTA_BASE: u8 = 1;

/// What a DELTA record describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeltaKind {
    Birth = 0,
    Death = 1,
    Value = 2,
    RootValue = 3,
    Hierarchical = 4,
    HierarchicalPrior = 5,
}

impl DeltaKind {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag.checked_sub(TAG_DELTA_BASE)? {
            0 => Some(DeltaKind::Birth),
            1 => Some(DeltaKind::Death),
            2 => Some(DeltaKind::Value),
            3 => Some(DeltaKind::RootValue),
            4 => Some(DeltaKind::Hierarchical),
            5 => Some(DeltaKind::HierarchicalPrior),
            _ => None,
        }
    }

    fn tag(self) -> u8 {
        TAG_DELTA_BASE + self as u8
    }
}

/// Segment base state: the live multiset and the cached scalars of the
/// moment the segment opened.
#[derive(Clone, Debug, PartialEq)]
pub struct InitRecord {
    pub live: Vec<(u32, f64)>,
    pub likelihood: f64,
    pub temperature: f64,
    pub lambda_scale: f64,
    pub log_normalization: f64,
}

/// One proposal outcome.
#[derive(Clone, Debug, PartialEq)]
pub struct DeltaRecord {
    pub kind: DeltaKind,
    pub accepted: bool,
    pub idx: u32,
    pub depth: u32,
    pub new_value: f64,
    pub old_value: Option<f64>,
    pub likelihood: f64,
    pub temperature: f64,
    pub lambda_scale: f64,
    pub log_normalization: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Record {
    Initialise(InitRecord),
    Delta(DeltaRecord),
}

// -- little-endian payload plumbing -----------------------------------------

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_f64(buf: &mut Vec<u8>, v: f64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

struct Payload<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Payload<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Payload { bytes, at: 0 }
    }

    fn take(&mut self, n: usize) -> CoreResult<&'a [u8]> {
        let end = self.at + n;
        if end > self.bytes.len() {
            return Err(CoreError::Invariant("chain history payload truncated".into()));
        }
        let out = &self.bytes[self.at..end];
        self.at = end;
        Ok(out)
    }

    fn u32(&mut self) -> CoreResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> CoreResult<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }
}

impl InitRecord {
    fn encode(&self, buf: &mut Vec<u8>) {
        put_f64(buf, self.likelihood);
        put_f64(buf, self.temperature);
        put_f64(buf, self.lambda_scale);
        put_f64(buf, self.log_normalization);
        put_u32(buf, self.live.len() as u32);
        for &(idx, value) in &self.live {
            put_u32(buf, idx);
            put_f64(buf, value);
        }
    }

    fn decode(payload: &mut Payload<'_>) -> CoreResult<Self> {
        let likelihood = payload.f64()?;
        let temperature = payload.f64()?;
        let lambda_scale = payload.f64()?;
        let log_normalization = payload.f64()?;
        let count = payload.u32()? as usize;
        let mut live = Vec::with_capacity(count);
        for _ in 0..count {
            let idx = payload.u32()?;
            let value = payload.f64()?;
            live.push((idx, value));
        }
        Ok(InitRecord {
            live,
            likelihood,
            temperature,
            lambda_scale,
            log_normalization,
        })
    }
}

impl DeltaRecord {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.accepted as u8);
        put_u32(buf, self.idx);
        put_u32(buf, self.depth);
        put_f64(buf, self.new_value);
        put_f64(buf, self.old_value.unwrap_or(f64::NAN));
        put_f64(buf, self.likelihood);
        put_f64(buf, self.temperature);
        put_f64(buf, self.lambda_scale);
        put_f64(buf, self.log_normalization);
    }

    fn decode(kind: DeltaKind, payload: &mut Payload<'_>) -> CoreResult<Self> {
        let accepted = payload.u8()? != 0;
        let idx = payload.u32()?;
        let depth = payload.u32()?;
        let new_value = payload.f64()?;
        let old_raw = payload.f64()?;
        let old_value = (!old_raw.is_nan()).then_some(old_raw);
        let likelihood = payload.f64()?;
        let temperature = payload.f64()?;
        let lambda_scale = payload.f64()?;
        let log_normalization = payload.f64()?;
        Ok(DeltaRecord {
            kind,
            accepted,
            idx,
            depth,
            new_value,
            old_value,
            likelihood,
            temperature,
            lambda_scale,
            log_normalization,
        })
    }
}

fn write_record(out: &mut impl Write, record: &Record) -> std::io::Result<()> {
    let mut payload = Vec::with_capacity(64);
    let tag = match record {
        Record::Initialise(init) => {
            init.encode(&mut payload);
            TAG_INITIALISE
        }
        Record::Delta(delta) => {
            delta.encode(&mut payload);
            delta.kind.tag()
        }
    };
    out.write_all(&[tag])?;
    out.write_all(&(payload.len() as u32).to_le_bytes())?;
    out.write_all(&payload)
}

/// Reads one record; `Ok(None)` on a clean EOF at a tag boundary.
pub fn read_record(input: &mut impl Read) -> CoreResult<Option<Record>> {
    let mut tag = [0u8; 1];
    match input.read_exact(&mut tag) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(CoreError::io("<chain history>", e)),
    }
    let mut len = [0u8; 4];
    input
        .read_exact(&mut len)
        .map_err(|e| CoreError::io("<chain history>", e))?;
    let len = u32::from_le_bytes(len) as usize;
    let mut bytes = vec![0u8; len];
    input
        .read_exact(&mut bytes)
        .map_err(|e| CoreError::io("<chain history>", e))?;

    let mut payload = Payload::new(&bytes);
    let record = match tag[0] {
        TAG_INITIALISE => Record::Initialise(InitRecord::decode(&mut payload)?),
        other => {
            let kind = DeltaKind::from_tag(other).ok_or_else(|| {
                CoreError::Invariant(format!("unknown chain history record tag {other}"))
            })?;
            Record::Delta(DeltaRecord::decode(kind, &mut payload)?)
        }
    };
    if payload.at != bytes.len() {
        return Err(CoreError::Invariant(
            "chain history record has trailing bytes".into(),
        ));
    }
    Ok(Some(record))
}

// -- the ring ----------------------------------------------------------------

/// Bounded record ring, always rooted at an INITIALISE record.
pub struct ChainHistory {
    capacity: usize,
    records: Vec<Record>,
}

impl ChainHistory {
    pub fn new(capacity: usize) -> Self {
        ChainHistory {
            capacity: capacity.max(2),
            records: Vec::new(),
        }
    }

    /// Opens a fresh segment from the given base state, discarding any
    /// unflushed content.
    pub fn initialise(&mut self, init: InitRecord) {
        self.records.clear();
        self.records.push(Record::Initialise(init));
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    /// Number of records in the open segment, the INITIALISE included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn add_step(&mut self, delta: DeltaRecord) -> CoreResult<()> {
        if self.records.is_empty() {
            return Err(CoreError::Invariant(
                "chain history step recorded before initialisation".into(),
            ));
        }
        self.records.push(Record::Delta(delta));
        Ok(())
    }

    /// Flushes the open segment to `out`. The ring keeps its content; call
    /// [`initialise`](Self::initialise) to start the next segment.
    pub fn write_segment(&self, out: &mut impl Write) -> CoreResult<()> {
        for record in &self.records {
            write_record(out, record).map_err(|e| CoreError::io("<chain history>", e))?;
        }
        Ok(())
    }
}

// -- replay ------------------------------------------------------------------

/// Counters reported after a replay.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReplayStats {
    pub segments: usize,
    pub deltas: usize,
}

/// Streams a chain-history file, maintaining the live multiset and the
/// hierarchical scalar, and invoking `callback` for every DELTA record
/// (accepted or not) with the multiset *after* the record applied.
pub fn replay<R, F>(input: &mut R, mut callback: F) -> CoreResult<ReplayStats>
where
    R: Read,
    F: FnMut(usize, &DeltaRecord, &BTreeMap<u32, f64>) -> CoreResult<()>,
{
    let mut live: BTreeMap<u32, f64> = BTreeMap::new();
    let mut stats = ReplayStats::default();
    let mut initialised = false;
    let mut step = 0usize;

    while let Some(record) = read_record(input)? {
        match record {
            Record::Initialise(init) => {
                live = init.live.iter().copied().collect();
                initialised = true;
                stats.segments += 1;
            }
            Record::Delta(delta) => {
                if !initialised {
                    return Err(CoreError::Invariant(
                        "chain history delta before any initialise record".into(),
                    ));
                }
                if delta.accepted {
                    match delta.kind {
                        DeltaKind::Birth => {
                            live.insert(delta.idx, delta.new_value);
                        }
                        DeltaKind::Death => {
                            live.remove(&delta.idx);
                        }
                        DeltaKind::Value | DeltaKind::RootValue => {
                            live.insert(delta.idx, delta.new_value);
                        }
                        DeltaKind::Hierarchical | DeltaKind::HierarchicalPrior => {}
                    }
                }
                callback(step, &delta, &live)?;
                stats.deltas += 1;
                step += 1;
            }
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init(live: Vec<(u32, f64)>) -> InitRecord {
        InitRecord {
            live,
            likelihood: 12.5,
            temperature: 1.0,
            lambda_scale: 1.0,
            log_normalization: -3.25,
        }
    }

    fn birth(idx: u32, value: f64, accepted: bool) -> DeltaRecord {
        DeltaRecord {
            kind: DeltaKind::Birth,
            accepted,
            idx,
            depth: 1,
            new_value: value,
            old_value: None,
            likelihood: 11.0,
            temperature: 1.0,
            lambda_scale: 1.0,
            log_normalization: -3.25,
        }
    }

    #[test]
    fn records_round_trip_bytewise() {
        let mut history = ChainHistory::new(16);
        history.initialise(init(vec![(0, 0.5), (1, -0.25)]));
        history.add_step(birth(3, 0.75, true)).unwrap();
        history
            .add_step(DeltaRecord {
                kind: DeltaKind::Hierarchical,
                accepted: false,
                idx: 0,
                depth: 0,
                new_value: 1.4,
                old_value: Some(1.0),
                likelihood: 11.0,
                temperature: 2.5,
                lambda_scale: 1.0,
                log_normalization: -3.0,
            })
            .unwrap();

        let mut bytes = Vec::new();
        history.write_segment(&mut bytes).unwrap();

        let mut cursor = std::io::Cursor::new(&bytes);
        let r1 = read_record(&mut cursor).unwrap().unwrap();
        let r2 = read_record(&mut cursor).unwrap().unwrap();
        let r3 = read_record(&mut cursor).unwrap().unwrap();
        assert!(read_record(&mut cursor).unwrap().is_none());

        assert_eq!(r1, Record::Initialise(init(vec![(0, 0.5), (1, -0.25)])));
        assert_eq!(r2, Record::Delta(birth(3, 0.75, true)));
        match r3 {
            Record::Delta(d) => {
                assert_eq!(d.kind, DeltaKind::Hierarchical);
                assert_eq!(d.old_value, Some(1.0));
                assert!(!d.accepted);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn replay_tracks_the_live_multiset() {
        let mut history = ChainHistory::new(16);
        history.initialise(init(vec![(0, 0.5)]));
        history.add_step(birth(2, 0.75, true)).unwrap();
        history.add_step(birth(3, 0.1, false)).unwrap(); // rejected: no effect
        history
            .add_step(DeltaRecord {
                kind: DeltaKind::Value,
                accepted: true,
                idx: 2,
                depth: 1,
                new_value: -0.5,
                old_value: Some(0.75),
                likelihood: 10.0,
                temperature: 1.0,
                lambda_scale: 1.0,
                log_normalization: -3.0,
            })
            .unwrap();
        history
            .add_step(DeltaRecord {
                kind: DeltaKind::Death,
                accepted: true,
                idx: 2,
                depth: 1,
                new_value: 0.0,
                old_value: Some(-0.5),
                likelihood: 12.0,
                temperature: 1.0,
                lambda_scale: 1.0,
                log_normalization: -3.0,
            })
            .unwrap();

        let mut bytes = Vec::new();
        history.write_segment(&mut bytes).unwrap();

        let mut seen = Vec::new();
        let stats = replay(&mut std::io::Cursor::new(&bytes), |step, delta, live| {
            seen.push((step, delta.accepted, live.clone()));
            Ok(())
        })
        .unwrap();

        assert_eq!(stats.segments, 1);
        assert_eq!(stats.deltas, 4);
        assert_eq!(seen[0].2.len(), 2);
        assert_eq!(seen[1].2.len(), 2); // rejected birth leaves the set alone
        assert_eq!(seen[2].2.get(&2), Some(&-0.5));
        assert_eq!(seen[3].2.len(), 1);
    }

    #[test]
    fn back_to_back_initialise_segments_replay() {
        let mut bytes = Vec::new();
        let mut history = ChainHistory::new(16);
        history.initialise(init(vec![(0, 0.5)]));
        history.add_step(birth(1, 0.2, true)).unwrap();
        history.write_segment(&mut bytes).unwrap();
        // Swap accepted: flush, then immediately re-initialise with the new
        // base state in the same file.
        history.initialise(init(vec![(0, 0.9), (1, 0.1), (3, 0.2)]));
        history.write_segment(&mut bytes).unwrap();
        history.initialise(init(vec![(0, 0.9)]));
        history.add_step(birth(2, 0.3, true)).unwrap();
        history.write_segment(&mut bytes).unwrap();

        let mut last_live = BTreeMap::new();
        let stats = replay(&mut std::io::Cursor::new(&bytes), |_, _, live| {
            last_live = live.clone();
            Ok(())
        })
        .unwrap();
        assert_eq!(stats.segments, 3);
        assert_eq!(stats.deltas, 2);
        assert_eq!(last_live.len(), 2);
        assert_eq!(last_live.get(&2), Some(&0.3));
    }

    #[test]
    fn truncated_records_are_rejected() {
        let mut bytes = Vec::new();
        let mut history = ChainHistory::new(4);
        history.initialise(init(vec![(0, 0.5)]));
        history.write_segment(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 3);
        let result = replay(&mut std::io::Cursor::new(&bytes), |_, _, _| Ok(()));
        assert!(result.is_err());
    }

    #[test]
    fn ring_reports_full_at_capacity() {
        let mut history = ChainHistory::new(3);
        history.initialise(init(vec![(0, 0.5)]));
        assert!(!history.is_full());
        history.add_step(birth(1, 0.1, true)).unwrap();
        history.add_step(birth(2, 0.1, false)).unwrap();
        assert!(history.is_full());
    }
}
