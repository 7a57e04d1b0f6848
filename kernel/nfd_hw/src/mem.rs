/// A byte-addressable memory, host-side or on-chip.
pub trait Memory: Send + Sync {
    fn read(&self, addr: u64, buf: &mut [u8]);

    fn write(&self, addr: u64, data: &[u8]);
}

/// Reads a fixed-size record at `addr`.
pub fn read_array<const N: usize>(mem: &dyn Memory, addr: u64) -> [u8; N] {
    let mut bytes = [0u8; N];
    mem.read(addr, &mut bytes);
    bytes
}
