//! RFI masks and their one-to-many distribution.
//!
//! A mask records which channels and integration intervals of a raw
//! observation were flagged as interference. It is produced once and handed
//! to every worker that prepares data for the search, so it has a compact
//! little-endian wire form and a broadcast helper built on channels.
//!
//! Wire layout:
//!
//! ```text
//! f64 × 6   timesigma freqsigma mjd dtint lofreq dfreq
//! i32 × 5   numchan numint ptsperint num_zap_chans num_zap_ints
//! i32 × num_zap_chans          zap_chans
//! i32 × num_zap_ints           zap_ints
//! i32 × numint                 channels per interval
//! i32 × Σ channels per interval  per-interval channel lists
//! ```

use std::io::{Cursor, Read};
use std::sync::mpsc::{self, Receiver, Sender};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use serde::{Deserialize, Serialize};

/// Errors raised while encoding, decoding or distributing a mask.
#[derive(Debug, thiserror::Error)]
pub enum MaskError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("mask record is truncated: {0}")]
    Truncated(&'static str),

    #[error("negative {field} count {value} in mask record")]
    NegativeCount { field: &'static str, value: i32 },

    #[error("{0} trailing bytes after mask record")]
    TrailingBytes(usize),

    #[error("inconsistent mask: {0}")]
    Inconsistent(String),

    #[error("mask channel closed before delivery")]
    Disconnected,
}

/// Channels and intervals flagged as interference.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RfiMask {
    pub timesigma: f64,
    pub freqsigma: f64,
    pub mjd: f64,
    /// Length of one interval (s).
    pub dtint: f64,
    pub lofreq: f64,
    pub dfreq: f64,
    pub numchan: i32,
    pub numint: i32,
    pub ptsperint: i32,
    /// Channels flagged in every interval.
    pub zap_chans: Vec<i32>,
    /// Intervals flagged in every channel.
    pub zap_ints: Vec<i32>,
    /// Channels flagged per interval; `chans.len() == numint`.
    pub chans: Vec<Vec<i32>>,
}

impl RfiMask {
    pub fn num_chans_per_int(&self) -> Vec<i32> {
        self.chans.iter().map(|c| c.len() as i32).collect()
    }

    /// True when `chan` is flagged during interval `int`.
    pub fn is_zapped(&self, chan: i32, int: i32) -> bool {
        if self.zap_chans.contains(&chan) || self.zap_ints.contains(&int) {
            return true;
        }
        usize::try_from(int)
            .ok()
            .and_then(|i| self.chans.get(i))
            .map_or(false, |c| c.contains(&chan))
    }

    /// Serialise to the wire layout.
    pub fn encode(&self) -> Result<Vec<u8>, MaskError> {
        if usize::try_from(self.numint).ok() != Some(self.chans.len()) {
            return Err(MaskError::Inconsistent(format!(
                "numint={} but {} interval lists",
                self.numint,
                self.chans.len()
            )));
        }
        let ints = self.zap_chans.len()
            + self.zap_ints.len()
            + self.chans.len()
            + self.chans.iter().map(Vec::len).sum::<usize>();
        let mut out = Vec::with_capacity(6 * 8 + (5 + ints) * 4);

        for v in [
            self.timesigma,
            self.freqsigma,
            self.mjd,
            self.dtint,
            self.lofreq,
            self.dfreq,
        ] {
            out.write_f64::<LittleEndian>(v)?;
        }
        for v in [
            self.numchan,
            self.numint,
            self.ptsperint,
            count(self.zap_chans.len())?,
            count(self.zap_ints.len())?,
        ] {
            out.write_i32::<LittleEndian>(v)?;
        }
        write_ints(&mut out, &self.zap_chans)?;
        write_ints(&mut out, &self.zap_ints)?;
        for chans in &self.chans {
            out.write_i32::<LittleEndian>(count(chans.len())?)?;
        }
        for chans in &self.chans {
            write_ints(&mut out, chans)?;
        }
        Ok(out)
    }

    /// Parse the wire layout. The record must be complete and nothing may
    /// follow it.
    pub fn decode(bytes: &[u8]) -> Result<Self, MaskError> {
        let mut cur = Cursor::new(bytes);
        let mut f = [0.0_f64; 6];
        for v in &mut f {
            *v = cur
                .read_f64::<LittleEndian>()
                .map_err(|_| MaskError::Truncated("header"))?;
        }
        let mut hdr = [0_i32; 5];
        for v in &mut hdr {
            *v = cur
                .read_i32::<LittleEndian>()
                .map_err(|_| MaskError::Truncated("header"))?;
        }
        let [numchan, numint, ptsperint, num_zap_chans, num_zap_ints] = hdr;

        let zap_chans = read_ints(&mut cur, "zap_chans", num_zap_chans)?;
        let zap_ints = read_ints(&mut cur, "zap_ints", num_zap_ints)?;
        let per_int = read_ints(&mut cur, "numint", numint)?;
        let mut chans = Vec::with_capacity(per_int.len());
        for &n in &per_int {
            chans.push(read_ints(&mut cur, "chans_per_int", n)?);
        }

        let trailing = bytes.len() - cur.position() as usize;
        if trailing != 0 {
            return Err(MaskError::TrailingBytes(trailing));
        }

        Ok(Self {
            timesigma: f[0],
            freqsigma: f[1],
            mjd: f[2],
            dtint: f[3],
            lofreq: f[4],
            dfreq: f[5],
            numchan,
            numint,
            ptsperint,
            zap_chans,
            zap_ints,
            chans,
        })
    }
}

fn count(len: usize) -> Result<i32, MaskError> {
    i32::try_from(len).map_err(|_| MaskError::Inconsistent(format!("{len} entries do not fit")))
}

fn write_ints(out: &mut Vec<u8>, values: &[i32]) -> Result<(), MaskError> {
    for &v in values {
        out.write_i32::<LittleEndian>(v)?;
    }
    Ok(())
}

fn read_ints(cur: &mut Cursor<&[u8]>, field: &'static str, n: i32) -> Result<Vec<i32>, MaskError> {
    let n = usize::try_from(n).map_err(|_| MaskError::NegativeCount { field, value: n })?;
    let remaining = cur.get_ref().len() - cur.position() as usize;
    if n.saturating_mul(4) > remaining {
        return Err(MaskError::Truncated(field));
    }
    let mut buf = vec![0_u8; n * 4];
    cur.read_exact(&mut buf)?;
    let mut values = vec![0_i32; n];
    LittleEndian::read_i32_into(&buf, &mut values);
    Ok(values)
}

// ---------------------------------------------------------------------------
// Broadcast
// ---------------------------------------------------------------------------

/// One-shot distribution of a mask from one producer to many consumers.
pub struct MaskBroadcast;

impl MaskBroadcast {
    /// Wire up a publisher and `consumers` subscribers.
    pub fn new(consumers: usize) -> (MaskPublisher, Vec<MaskSubscriber>) {
        let (ack_tx, ack_rx) = mpsc::channel();
        let mut senders = Vec::with_capacity(consumers);
        let mut subscribers = Vec::with_capacity(consumers);
        for _ in 0..consumers {
            let (tx, rx) = mpsc::channel();
            senders.push(tx);
            subscribers.push(MaskSubscriber {
                record: rx,
                ack: ack_tx.clone(),
            });
        }
        (
            MaskPublisher {
                senders,
                acks: ack_rx,
            },
            subscribers,
        )
    }
}

/// Sending half of a [`MaskBroadcast`].
pub struct MaskPublisher {
    senders: Vec<Sender<Vec<u8>>>,
    acks: Receiver<()>,
}

impl MaskPublisher {
    /// Send `mask` to every subscriber and block until each has taken it.
    pub fn publish(self, mask: &RfiMask) -> Result<(), MaskError> {
        let record = mask.encode()?;
        for tx in &self.senders {
            tx.send(record.clone()).map_err(|_| MaskError::Disconnected)?;
        }
        for _ in 0..self.senders.len() {
            self.acks.recv().map_err(|_| MaskError::Disconnected)?;
        }
        debug!(
            "Mask of {} bytes delivered to {} subscriber(s)",
            record.len(),
            self.senders.len()
        );
        Ok(())
    }
}

/// Receiving half of a [`MaskBroadcast`].
pub struct MaskSubscriber {
    record: Receiver<Vec<u8>>,
    ack: Sender<()>,
}

impl MaskSubscriber {
    /// Block until the mask arrives, then decode it.
    pub fn receive(self) -> Result<RfiMask, MaskError> {
        let record = self.record.recv().map_err(|_| MaskError::Disconnected)?;
        // the publisher may already be gone; delivery still succeeded
        let _ = self.ack.send(());
        RfiMask::decode(&record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn mask() -> RfiMask {
        RfiMask {
            timesigma: 10.0,
            freqsigma: 4.0,
            mjd: 53_000.25,
            dtint: 2.0,
            lofreq: 1400.0,
            dfreq: 0.5,
            numchan: 64,
            numint: 3,
            ptsperint: 2400,
            zap_chans: vec![0, 63],
            zap_ints: vec![2],
            chans: vec![vec![5, 6], vec![], vec![40]],
        }
    }

    #[test]
    fn record_survives_the_wire() {
        let m = mask();
        let bytes = m.encode().unwrap();
        assert_eq!(bytes.len(), 48 + 4 * (5 + 2 + 1 + 3 + 3));
        assert_eq!(RfiMask::decode(&bytes).unwrap(), m);
        assert_eq!(m.num_chans_per_int(), vec![2, 0, 1]);
    }

    #[test]
    fn zapped_lookup() {
        let m = mask();
        assert!(m.is_zapped(0, 1));
        assert!(m.is_zapped(30, 2));
        assert!(m.is_zapped(6, 0));
        assert!(!m.is_zapped(6, 1));
        assert!(!m.is_zapped(6, -1));
    }

    #[test]
    fn malformed_records_are_rejected() {
        let bytes = mask().encode().unwrap();
        assert!(matches!(
            RfiMask::decode(&bytes[..bytes.len() - 1]),
            Err(MaskError::Truncated(_))
        ));
        assert!(matches!(
            RfiMask::decode(&bytes[..20]),
            Err(MaskError::Truncated("header"))
        ));

        let mut long = bytes.clone();
        long.extend_from_slice(&[0, 0]);
        assert!(matches!(RfiMask::decode(&long), Err(MaskError::TrailingBytes(2))));

        let mut negative = bytes;
        negative[48 + 12..48 + 16].copy_from_slice(&(-1_i32).to_le_bytes());
        assert!(matches!(
            RfiMask::decode(&negative),
            Err(MaskError::NegativeCount { field: "zap_chans", value: -1 })
        ));
    }

    #[test]
    fn inconsistent_mask_does_not_encode() {
        let m = RfiMask {
            numint: 5,
            ..mask()
        };
        assert!(matches!(m.encode(), Err(MaskError::Inconsistent(_))));
    }

    #[test]
    fn every_subscriber_gets_the_same_mask() {
        let (publisher, subscribers) = MaskBroadcast::new(4);
        let handles: Vec<_> = subscribers
            .into_iter()
            .map(|s| thread::spawn(move || s.receive()))
            .collect();

        publisher.publish(&mask()).unwrap();
        for h in handles {
            assert_eq!(h.join().unwrap().unwrap(), mask());
        }
    }

    #[test]
    fn dropped_publisher_disconnects_subscribers() {
        let (publisher, mut subscribers) = MaskBroadcast::new(1);
        drop(publisher);
        let sub = subscribers.pop().unwrap();
        assert!(matches!(sub.receive(), Err(MaskError::Disconnected)));
    }
}
