//! Default values of every data-plane tunable.
//!
//! The thresholds here were tuned for one generation of hardware timing.
//! They do not carry over to other ring sizes or DMA latencies without
//! being re-derived.

/// Packets per batch. Fixed: descriptor slots and issued records are sized
/// for it.
pub const MAX_BATCH_SZ: u32 = 4;

/// Queues a bitmask can address.
pub const MAX_QUEUES: u32 = 64;

pub const GATHER_MAX_RETRIES: u32 = 5;
/// A queue with fewer than `BACKLOG_FACTOR * MAX_BATCH_SZ` known descriptors
/// gets its write pointer re-read.
pub const BACKLOG_FACTOR: u32 = 7;
/// Backlog beyond which a queue is marked pending.
pub const PENDING_TEST: u32 = 0;
/// Descriptor alignment gather rounds batches to.
pub const BATCH_WINDOW: u32 = 4;
pub const GATHER_MAX_IN_FLIGHT: u32 = 16;
pub const BATCH_RING_SIZE: u32 = 8;
pub const DESC_BATCH_SLOTS: u32 = 16;
pub const ISSUED_RING_SIZE: u32 = 16;
pub const ISSUE_LANES: u8 = 2;
pub const ISSUE_CONTEXTS: usize = 4;
pub const NOTIFY_CONTEXTS: usize = 4;
/// Bytes reserved at the start of a TX buffer ahead of the packet.
pub const TX_DATA_OFFSET: u32 = 64;
/// Largest metadata offset a TX descriptor can carry (7 bits).
pub const TX_DESC_MAX_OFFSET: u32 = 127;
pub const PRECACHE_BUFS: u32 = 32;
/// Segments one LSO packet is cut into at most.
pub const MAX_LSO_SEGS: u32 = 255;
/// Holds every segment of a batch of maximally cut LSO packets.
pub const LSO_RING_SIZE: u32 = 1024;
pub const NUM_WQS: u8 = 1;

pub const FL_BATCH_SZ: u32 = 8;
pub const FL_BUFS_PER_QUEUE: u32 = 256;
pub const FL_MAX_IN_FLIGHT: u32 = 16;
/// Cached free-list buffers below which a queue turns urgent.
pub const FL_SOFT_THRESH: u32 = 16;
pub const DESC_BATCH_RING: u32 = 32;
pub const DESC_MAX_IN_FLIGHT: u32 = 32;
pub const RX_DATA_MAX_IN_FLIGHT: u32 = 32;
pub const INPUT_RING_SIZE: u32 = 128;
pub const STAGE_CONTEXTS: usize = 4;
pub const RX_DATA_CONTEXTS: usize = 4;
pub const SEND_CONTEXTS: usize = 2;
pub const RX_OFFSET: u32 = 0;

pub const MAX_VFS: u8 = 4;
pub const MAX_VF_QUEUES: u8 = 8;
pub const MAX_PF_QUEUES: u8 = 32;
pub const PF_RID_OFFSET: u8 = 0;
pub const VF_RID_OFFSET: u8 = 64;

/// Host rings must hold between 2^8 and 2^18 descriptors.
pub const MIN_RING_SZ_LOG2: u8 = 8;
pub const MAX_RING_SZ_LOG2: u8 = 18;
pub const RING_BASE_ALIGN: u64 = 256;

const_assert!(BATCH_WINDOW.is_power_of_two() && BATCH_WINDOW >= MAX_BATCH_SZ);
const_assert!(DESC_BATCH_SLOTS > BATCH_RING_SIZE);
const_assert!(DESC_BATCH_SLOTS.is_power_of_two());
const_assert!(GATHER_MAX_IN_FLIGHT <= 32);
const_assert!(TX_DATA_OFFSET <= TX_DESC_MAX_OFFSET);
const_assert!(LSO_RING_SIZE >= MAX_BATCH_SZ * MAX_LSO_SEGS);
const_assert!(FL_BUFS_PER_QUEUE % FL_BATCH_SZ == 0);
const_assert!(FL_MAX_IN_FLIGHT.is_power_of_two());
const_assert!(DESC_MAX_IN_FLIGHT > MAX_BATCH_SZ);
const_assert!(DESC_MAX_IN_FLIGHT <= DESC_BATCH_RING * MAX_BATCH_SZ);
const_assert!(MAX_VFS as u32 * MAX_VF_QUEUES as u32 + MAX_PF_QUEUES as u32 <= MAX_QUEUES);
