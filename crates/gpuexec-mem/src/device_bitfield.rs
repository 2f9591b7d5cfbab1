use bitflags::bitflags;

bitflags! {
    /// Tiles (sub-devices) that must see an allocation or that an engine executes on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceBitfield: u32 {
        const TILE0 = 1 << 0;
        const TILE1 = 1 << 1;
        const TILE2 = 1 << 2;
        const TILE3 = 1 << 3;
    }
}

impl DeviceBitfield {
    /// Bitfield covering the first `count` tiles.
    pub fn first_tiles(count: u32) -> Self {
        let count = count.clamp(1, 4);
        Self::from_bits_truncate((1u32 << count) - 1)
    }

    pub fn tile_count(self) -> u32 {
        self.bits().count_ones()
    }

    pub fn is_multi_tile(self) -> bool {
        self.tile_count() > 1
    }
}

impl Default for DeviceBitfield {
    fn default() -> Self {
        Self::TILE0
    }
}
