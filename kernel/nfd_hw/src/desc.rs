//! Descriptor layouts shared with the host driver, and the notification
//! message handed to downstream processing.
//!
//! Host descriptors are little-endian. Each type converts to and from its
//! exact byte image; the in-memory struct is only a convenient view.

use bit_field::BitField;

/// TX descriptor flag: large-segmentation offload requested.
pub const TX_FLAG_LSO: u8 = 1 << 2;
/// TX descriptor flag: insert `vlan`.
pub const TX_FLAG_VLAN: u8 = 1 << 3;

/// The largest DMA address a descriptor can carry.
pub const DMA_ADDR_MASK: u64 = (1 << 40) - 1;

/// A host TX descriptor, 16 bytes.
///
/// ```text
///  0..2   dma_len          8..10  mss
///  2      offset | eop<<7  10     lso_hdrlen
///  3      dma_addr[39:32]  11     flags
///  4..8   dma_addr[31:0]   12..14 vlan
///                          14..16 data_len
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TxDesc {
    /// Host address of this descriptor's data.
    pub dma_addr: u64,
    /// Bytes of data this descriptor covers.
    pub dma_len: u16,
    /// Bytes of metadata prepended to the packet.
    pub offset: u8,
    /// Last descriptor of the packet.
    pub eop: bool,
    pub mss: u16,
    pub lso_hdrlen: u8,
    pub flags: u8,
    pub vlan: u16,
    /// Length of the whole packet.
    pub data_len: u16,
}

impl TxDesc {
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0..2].copy_from_slice(&self.dma_len.to_le_bytes());
        let mut offset_eop = 0u8;
        offset_eop.set_bits(0..7, self.offset & 0x7f);
        offset_eop.set_bit(7, self.eop);
        b[2] = offset_eop;
        b[3] = (self.dma_addr >> 32) as u8;
        b[4..8].copy_from_slice(&(self.dma_addr as u32).to_le_bytes());
        b[8..10].copy_from_slice(&(self.mss & 0x3fff).to_le_bytes());
        b[10] = self.lso_hdrlen;
        b[11] = self.flags;
        b[12..14].copy_from_slice(&self.vlan.to_le_bytes());
        b[14..16].copy_from_slice(&self.data_len.to_le_bytes());
        b
    }

    pub fn from_bytes(b: &[u8; Self::SIZE]) -> TxDesc {
        TxDesc {
            dma_len: u16::from_le_bytes([b[0], b[1]]),
            offset: b[2].get_bits(0..7),
            eop: b[2].get_bit(7),
            dma_addr: (u64::from(b[3]) << 32)
                | u64::from(u32::from_le_bytes([b[4], b[5], b[6], b[7]])),
            mss: u16::from_le_bytes([b[8], b[9]]) & 0x3fff,
            lso_hdrlen: b[10],
            flags: b[11],
            vlan: u16::from_le_bytes([b[12], b[13]]),
            data_len: u16::from_le_bytes([b[14], b[15]]),
        }
    }

    /// Returns `true` if the packet asks for segmentation.
    pub fn is_lso(&self) -> bool {
        self.flags & TX_FLAG_LSO != 0 && self.mss != 0
    }
}

/// A host free-list descriptor, 8 bytes: `dma_addr[39:32]`, three reserved
/// bytes, then `dma_addr[31:0]`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlDesc {
    pub dma_addr: u64,
}

impl FlDesc {
    pub const SIZE: usize = 8;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0] = (self.dma_addr >> 32) as u8;
        b[4..8].copy_from_slice(&(self.dma_addr as u32).to_le_bytes());
        b
    }

    pub fn from_bytes(b: &[u8; Self::SIZE]) -> FlDesc {
        FlDesc {
            dma_addr: (u64::from(b[0]) << 32) | u64::from(u32::from_le_bytes([b[4], b[5], b[6], b[7]])),
        }
    }
}

/// A host RX descriptor, 8 bytes. It overwrites the free-list descriptor
/// that supplied the packet's buffer.
///
/// ```text
///  0     meta_len | dd<<7     4..6  vlan
///  1     reserved             6..8  flags
///  2..4  data_len
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RxDesc {
    /// Descriptor done: set by the NIC once the packet is in host memory.
    pub dd: bool,
    pub meta_len: u8,
    pub data_len: u16,
    pub vlan: u16,
    pub flags: u16,
}

impl RxDesc {
    pub const SIZE: usize = 8;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        let mut meta_dd = 0u8;
        meta_dd.set_bits(0..7, self.meta_len & 0x7f);
        meta_dd.set_bit(7, self.dd);
        b[0] = meta_dd;
        b[2..4].copy_from_slice(&self.data_len.to_le_bytes());
        b[4..6].copy_from_slice(&self.vlan.to_le_bytes());
        b[6..8].copy_from_slice(&self.flags.to_le_bytes());
        b
    }

    pub fn from_bytes(b: &[u8; Self::SIZE]) -> RxDesc {
        RxDesc {
            meta_len: b[0].get_bits(0..7),
            dd: b[0].get_bit(7),
            data_len: u16::from_le_bytes([b[2], b[3]]),
            vlan: u16::from_le_bytes([b[4], b[5]]),
            flags: u16::from_le_bytes([b[6], b[7]]),
        }
    }
}

/// The message telling downstream processing that a packet's data has
/// arrived in an on-chip buffer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PktDesc {
    /// PCIe island the packet came from.
    pub intf: u8,
    /// Natural queue number.
    pub queue: u8,
    /// Start of packet data relative to the buffer's data offset.
    pub offset: u8,
    pub buf_addr: super::BufAddr,
    pub data_len: u16,
    pub flags: u8,
    pub vlan: u16,
    pub mss: u16,
    pub lso_hdrlen: u8,
    /// LSO segment index, starting at 1; 0 for a packet that is not segmented.
    pub lso_seq: u8,
    /// Last segment of an LSO packet.
    pub lso_end: bool,
    /// Per-work-queue sequence number, when enabled.
    pub seqn: u32,
}
