// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Append-only segment files for the spool and DLQ tiers.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use otb_repr::Record;

use crate::frame::{FrameCrypto, LEN_PREFIX, MAX_FRAME_LEN, NONCE_LEN, TAG_LEN};
use crate::SpoolError;

/// A dead-lettered record together with the reason the sink refused it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub reason: String,
    pub record: Record,
}

pub(crate) fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{:08}.seg", seq))
}

/// A finished, immutable segment awaiting consumption.
#[derive(Debug, Clone)]
pub(crate) struct SegmentMeta {
    pub seq: u64,
    pub path: PathBuf,
    pub records: u64,
    pub bytes: u64,
}

/// The active segment being appended to.
pub(crate) struct SegmentWriter {
    file: File,
    pub seq: u64,
    pub path: PathBuf,
    pub records: u64,
    pub bytes: u64,
    pub created: Instant,
}

impl SegmentWriter {
    pub fn create(dir: &Path, seq: u64) -> Result<SegmentWriter, SpoolError> {
        let path = segment_path(dir, seq);
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        Ok(SegmentWriter {
            file,
            seq,
            path,
            records: 0,
            bytes: 0,
            created: Instant::now(),
        })
    }

    pub fn append(&mut self, frame: &[u8]) -> Result<(), SpoolError> {
        self.file.write_all(frame)?;
        self.records += 1;
        self.bytes += frame.len() as u64;
        Ok(())
    }

    /// Closes the segment. Durability is enforced here, once per segment,
    /// not per record.
    pub fn finish(self, fsync: bool) -> Result<SegmentMeta, SpoolError> {
        if fsync {
            self.file.sync_all()?;
        }
        Ok(SegmentMeta {
            seq: self.seq,
            path: self.path,
            records: self.records,
            bytes: self.bytes,
        })
    }
}

/// A sequential reader over one finished segment.
pub(crate) struct SegmentReader {
    reader: BufReader<File>,
}

impl SegmentReader {
    pub fn open(path: &Path) -> Result<SegmentReader, SpoolError> {
        Ok(SegmentReader {
            reader: BufReader::new(File::open(path)?),
        })
    }

    /// Reads and decrypts the next frame, returning the plaintext record
    /// image, its on-disk frame size, or `None` at end of segment.
    pub fn next_frame(
        &mut self,
        crypto: &FrameCrypto,
    ) -> Result<Option<(Vec<u8>, u64)>, SpoolError> {
        match self.next_frame_raw()? {
            Some(raw) => {
                let plaintext = crypto.open(&raw[LEN_PREFIX..])?;
                Ok(Some((plaintext, raw.len() as u64)))
            }
            None => Ok(None),
        }
    }

    /// Reads the next frame without decrypting it, length prefix included.
    /// Used when relocating frames between segments.
    pub fn next_frame_raw(&mut self) -> Result<Option<Vec<u8>>, SpoolError> {
        let mut len_buf = [0u8; LEN_PREFIX];
        match self.reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let body_len = u32::from_be_bytes(len_buf) as usize;
        if body_len < NONCE_LEN + TAG_LEN || body_len > MAX_FRAME_LEN {
            return Err(SpoolError::Corrupt(format!(
                "implausible frame length {}",
                body_len
            )));
        }
        let mut frame = vec![0u8; LEN_PREFIX + body_len];
        frame[..LEN_PREFIX].copy_from_slice(&len_buf);
        self.reader.read_exact(&mut frame[LEN_PREFIX..])?;
        Ok(Some(frame))
    }
}

/// Scans every segment in `dir` after a restart, truncating the partially
/// written tail of the newest segment to its last frame that authenticates
/// and deleting empty leftovers. Returns the surviving segments in append
/// order and the next segment sequence number.
pub(crate) fn recover_dir(
    dir: &Path,
    crypto: &FrameCrypto,
) -> Result<(VecDeque<SegmentMeta>, u64), SpoolError> {
    fs::create_dir_all(dir)?;
    let mut seqs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(".seg") {
            if let Ok(seq) = stem.parse::<u64>() {
                seqs.push(seq);
            }
        }
    }
    seqs.sort_unstable();

    let mut segments = VecDeque::new();
    let mut next_seq = 1;
    for seq in seqs {
        let path = segment_path(dir, seq);
        let meta = recover_segment(&path, seq, crypto)?;
        next_seq = seq + 1;
        match meta {
            Some(meta) => segments.push_back(meta),
            None => {
                // Nothing valid survived; a crash left an empty or
                // all-garbage file behind.
                fs::remove_file(&path)?;
            }
        }
    }
    if !segments.is_empty() {
        info!(
            segments = segments.len(),
            records = segments.iter().map(|s| s.records).sum::<u64>(),
            dir = %dir.display(),
            "recovered spool segments"
        );
    }
    Ok((segments, next_seq))
}

/// Validates one segment frame-by-frame, truncating at the first frame that
/// fails to authenticate or parse. Returns `None` when no frame survives.
fn recover_segment(
    path: &Path,
    seq: u64,
    crypto: &FrameCrypto,
) -> Result<Option<SegmentMeta>, SpoolError> {
    let file_len = fs::metadata(path)?.len();
    let mut reader = SegmentReader::open(path)?;
    let mut records = 0u64;
    let mut valid_bytes = 0u64;
    loop {
        match reader.next_frame(crypto) {
            Ok(Some((_, frame_len))) => {
                records += 1;
                valid_bytes += frame_len;
            }
            Ok(None) => break,
            Err(_) => {
                // Torn tail: everything up to here is good, the rest is not
                // data. At most one record is lost, and it was never
                // acknowledged to the producer as spooled.
                warn!(
                    segment = seq,
                    valid_bytes,
                    file_len,
                    "truncating torn spool segment tail"
                );
                break;
            }
        }
    }
    if valid_bytes < file_len {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(valid_bytes)?;
        file.sync_all()?;
    }
    if records == 0 {
        return Ok(None);
    }
    Ok(Some(SegmentMeta {
        seq,
        path: path.to_owned(),
        records,
        bytes: valid_bytes,
    }))
}
