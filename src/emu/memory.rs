use crate::plat::{IO_SIZE, IO_START, RAM_SIZE, RAM_START, ROM_SIZE, SP_HIGH_PORT, SP_LOW_PORT};

/// The three regions of the 16-bit address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    /// `0x0000..0x8000`
    Rom,
    /// `0x8000..0xFF00`
    Ram,
    /// `0xFF00..=0xFFFF`
    Io,
}

impl Region {
    /// Maps an address to its region and the offset within it.
    pub fn of(addr: u16) -> (Self, usize) {
        if addr < RAM_START {
            (Self::Rom, addr as usize)
        } else if addr < IO_START {
            (Self::Ram, (addr - RAM_START) as usize)
        } else {
            (Self::Io, (addr - IO_START) as usize)
        }
    }
}

/// Side effect of a memory write that the CPU has to apply to its own registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoResponse {
    None,
    StackPointerLow(u8),
    StackPointerHigh(u8),
}

/// System memory. Every byte is readable and writable, ROM included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memory {
    pub rom: Box<[u8]>,
    pub ram: Box<[u8]>,
    pub io: Box<[u8]>,
}

impl Memory {
    /// Creates a new [`Memory`] instance with every byte zeroed.
    pub fn new() -> Self {
        Self {
            rom: vec![0u8; ROM_SIZE].into_boxed_slice(),
            ram: vec![0u8; RAM_SIZE].into_boxed_slice(),
            io: vec![0u8; IO_SIZE].into_boxed_slice(),
        }
    }

    pub fn read(&self, addr: u16) -> u8 {
        match Region::of(addr) {
            (Region::Rom, i) => self.rom[i],
            (Region::Ram, i) => self.ram[i],
            (Region::Io, i) => self.io[i],
        }
    }

    /// Writes a byte. Writes to the stack pointer ports report the new value so the CPU can
    /// mirror it into SP.
    pub fn write(&mut self, addr: u16, value: u8) -> IoResponse {
        match Region::of(addr) {
            (Region::Rom, i) => self.rom[i] = value,
            (Region::Ram, i) => self.ram[i] = value,
            (Region::Io, i) => {
                self.io[i] = value;
                if i == SP_LOW_PORT as usize {
                    return IoResponse::StackPointerLow(value);
                }
                if i == SP_HIGH_PORT as usize {
                    return IoResponse::StackPointerHigh(value);
                }
            }
        }
        IoResponse::None
    }

    /// Reads an I/O port by its offset from the start of the I/O window.
    pub fn io(&self, port: u8) -> u8 {
        self.io[port as usize]
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regions() {
        assert_eq!(Region::of(0x0000), (Region::Rom, 0));
        assert_eq!(Region::of(0x7FFF), (Region::Rom, 0x7FFF));
        assert_eq!(Region::of(0x8000), (Region::Ram, 0));
        assert_eq!(Region::of(0xFEFF), (Region::Ram, 0x7EFF));
        assert_eq!(Region::of(0xFF00), (Region::Io, 0));
        assert_eq!(Region::of(0xFFFF), (Region::Io, 0xFF));
    }

    #[test]
    fn test_rom_is_writable() {
        let mut mem = Memory::new();
        assert_eq!(mem.write(0x0010, 0xAA), IoResponse::None);
        assert_eq!(mem.read(0x0010), 0xAA);
        mem.write(0xFEFF, 0x55);
        assert_eq!(mem.ram[0x7EFF], 0x55);
    }

    #[test]
    fn test_stack_pointer_ports() {
        let mut mem = Memory::new();
        assert_eq!(mem.write(0xFF08, 0x34), IoResponse::StackPointerLow(0x34));
        assert_eq!(mem.write(0xFF09, 0xFE), IoResponse::StackPointerHigh(0xFE));
        assert_eq!(mem.write(0xFF00, 0x01), IoResponse::None);
        assert_eq!(mem.io(0x08), 0x34);
        assert_eq!(mem.io(0x00), 0x01);
    }
}
