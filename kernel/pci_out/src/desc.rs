//! The records the PCI.OUT stages hand each other.

use bit_field::BitField;
use nfd_cfg::config::MAX_BATCH_SZ;
use nfd_hw::{desc::RxDesc, BufAddr};

const MAX_BATCH: usize = MAX_BATCH_SZ as usize;

/// A packet, or one segment of a packet, offered to PCI.OUT.
///
/// Segments of one packet share `buf` and are offered back to back with
/// `sop` on the first and `eop` on the last. The buffer is released after
/// the last one is written to the host.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RxPkt {
    pub queue: u8,
    /// NIC buffer holding the data.
    pub buf: BufAddr,
    /// Offset of this segment's data in `buf`.
    pub offset: u16,
    /// Bytes in this segment.
    pub seg_len: u16,
    /// Bytes in the whole packet, as reported to the host.
    pub data_len: u16,
    pub meta_len: u8,
    pub flags: u16,
    pub vlan: u16,
    pub sop: bool,
    pub eop: bool,
}

impl RxPkt {
    /// A single-segment packet of `len` bytes at `offset` in `buf`.
    pub fn new(queue: u8, buf: BufAddr, offset: u16, len: u16) -> RxPkt {
        RxPkt { queue, buf, offset, seg_len: len, data_len: len, sop: true, eop: true, ..Default::default() }
    }

    /// The RX descriptor reporting this packet to the host.
    pub fn rx_desc(&self) -> RxDesc {
        RxDesc { dd: true, meta_len: self.meta_len, data_len: self.data_len, vlan: self.vlan, flags: self.flags }
    }
}

/// One packet of a data batch, as the payload DMA stage needs it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RxDataDesc {
    pub queue: u8,
    pub buf: BufAddr,
    pub offset: u16,
    pub seg_len: u16,
    /// Where the free-list descriptor of the packet's host buffer is cached.
    pub fl_cache_addr: u64,
    pub rid: u8,
    pub sop: bool,
    pub eop: bool,
    /// The queue was down when the packet was staged: skip the payload DMA.
    pub down: bool,
}

/// A batch of up to four packets in staging order.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RxDataBatch {
    pub num: u8,
    pub pkts: [RxDataDesc; MAX_BATCH],
}

impl RxDataBatch {
    pub fn pkts(&self) -> &[RxDataDesc] {
        &self.pkts[..usize::from(self.num).min(MAX_BATCH)]
    }
}

/// Which packets of a staged batch get an RX descriptor, packed into one
/// word so it can be published with a single store.
///
/// ```text
///  0..3   num
///  3..7   send bit per packet
///  8..40  queue per packet, 8 bits each
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DescBatchMsg {
    pub num: u8,
    pub send: [bool; MAX_BATCH],
    pub queue: [u8; MAX_BATCH],
}

impl DescBatchMsg {
    pub fn to_word(&self) -> u64 {
        let mut word = 0u64;
        word.set_bits(0..3, u64::from(self.num & 0x7));
        for i in 0..MAX_BATCH {
            let bit = i as u8;
            word.set_bit(3 + bit, self.send[i]);
            let lo = 8 + 8 * bit;
            word.set_bits(lo..lo + 8, u64::from(self.queue[i]));
        }
        word
    }

    pub fn from_word(word: u64) -> DescBatchMsg {
        let mut msg = DescBatchMsg { num: word.get_bits(0..3) as u8, ..Default::default() };
        for i in 0..MAX_BATCH {
            let bit = i as u8;
            msg.send[i] = word.get_bit(3 + bit);
            let lo = 8 + 8 * bit;
            msg.queue[i] = word.get_bits(lo..lo + 8) as u8;
        }
        msg
    }
}
