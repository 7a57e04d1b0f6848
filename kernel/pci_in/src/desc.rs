//! Records passed between the PCI.IN stages.

use bit_field::BitField;
use nfd_hw::BufAddr;

/// A batch of descriptors gather fetched for one queue.
///
/// It travels through the hand-off ring as one word: the queue in bits 0..8
/// and the packet count in bits 8..11.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BatchDesc {
    pub queue: u8,
    pub num: u8,
}

impl BatchDesc {
    pub fn to_word(&self) -> u32 {
        let mut word = 0u32;
        word.set_bits(0..8, u32::from(self.queue));
        word.set_bits(8..11, u32::from(self.num));
        word
    }

    pub fn from_word(word: u32) -> BatchDesc {
        BatchDesc {
            queue: word.get_bits(0..8) as u8,
            num: word.get_bits(8..11) as u8,
        }
    }
}

/// What issue_dma tells notify about one packet descriptor.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IssuedDesc {
    /// The packet is complete in its buffer and should be notified.
    pub eop: bool,
    pub offset: u8,
    pub buf_addr: BufAddr,
    pub data_len: u16,
    pub flags: u8,
    pub vlan: u16,
    pub mss: u16,
    pub lso_hdrlen: u8,
    /// Segments waiting on the LSO ring for this packet.
    pub lso_count: u8,
}

/// One batch as handed from issue_dma to notify.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IssuedBatch {
    pub queue: u8,
    /// Host descriptors consumed, added to the queue's read pointer.
    /// Zero for a queue that was down.
    pub num_batch: u8,
    /// Packet descriptors in `descs`.
    pub count: u8,
    pub descs: [IssuedDesc; 4],
}
