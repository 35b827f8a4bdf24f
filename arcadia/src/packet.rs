//! Decoding of the 64 bit packets drained from a chip's readout FIFO
use thiserror::Error;

/// Size of the pixel matrix along each side
pub const MATRIX_SIZE: u16 = 512;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Hit at row {row}, column {col} lies outside of the matrix")]
    OutOfBounds { row: u16, col: u16 },
}

fn field(word: u64, offset: u32, bits: u32) -> u64 {
    (word >> offset) & ((1 << bits) - 1)
}

/// A hit pixel of the matrix
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Pixel {
    pub row: u16,
    pub col: u16,
}

impl Pixel {
    #[must_use]
    pub fn section(&self) -> u16 {
        self.col >> 5
    }

    #[must_use]
    pub fn double_column(&self) -> u16 {
        (self.col >> 1) & 0xf
    }

    #[must_use]
    pub fn core_pr(&self) -> u16 {
        self.row >> 2
    }

    /// Whether the pixel sits in the master half of its pixel region
    #[must_use]
    pub fn master(&self) -> bool {
        (self.row >> 1) & 1 == 1
    }

    /// Position of the pixel within its half of the pixel region
    #[must_use]
    pub fn index(&self) -> u16 {
        (self.row & 1) * 2 + (self.col & 1)
    }
}

/// Hits of one pixel region, as reported by the chip
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChipData {
    pub bottom: bool,
    pub hitmap: u8,
    pub corepr: u8,
    pub col: u8,
    pub sec: u8,
    /// Chip timestamp
    pub ts: u8,
    /// Board timestamp at the time the packet was received
    pub ts_fpga: u32,
    /// Serializer the packet arrived on
    pub ser: u8,
}

impl ChipData {
    fn decode(word: u64) -> Self {
        Self {
            bottom: field(word, 0, 1) == 1,
            hitmap: field(word, 1, 8) as u8,
            corepr: field(word, 9, 7) as u8,
            col: field(word, 16, 4) as u8,
            sec: field(word, 20, 4) as u8,
            ts: field(word, 24, 8) as u8,
            ts_fpga: field(word, 32, 24) as u32,
            ser: field(word, 56, 4) as u8,
        }
    }

    /// Index of the pixel region's master in the whole chip
    #[must_use]
    pub fn master_index(&self) -> u32 {
        (u32::from(self.sec) * 16 + u32::from(self.col)) * 128 + u32::from(self.corepr)
    }

    /// Expand the hit map into the pixels that were hit
    /// # Errors
    /// Returns an error if a hit lands outside of the matrix
    pub fn pixels(&self) -> Result<Vec<Pixel>, Error> {
        (0..8u16)
            .filter(|pix| (self.hitmap >> pix) & 1 == 1)
            .map(|pix| {
                let pr_row = u16::from(pix % 4 > 1);
                let pr_col = pix % 2;
                let (corepr, base) = if pix > 3 {
                    (u16::from(self.corepr), 2)
                } else {
                    (u16::from(self.corepr) + 1 - u16::from(self.bottom), 0)
                };
                let row = base + corepr * 4 + pr_row;
                let col = u16::from(self.sec) * 32 + u16::from(self.col) * 2 + pr_col;
                if row >= MATRIX_SIZE || col >= MATRIX_SIZE {
                    return Err(Error::OutOfBounds { row, col });
                }
                Ok(Pixel { row, col })
            })
            .collect()
    }

    /// Combine the chip and board timestamps with the number of board timestamp overflows seen
    /// so far into a single timestamp
    #[must_use]
    pub fn extended_timestamp(&self, overflows: u64) -> u64 {
        let mut base = (overflows << 24) | u64::from(self.ts_fpga & 0xff_ff00);
        // The chip's counter was latched before the board's low byte wrapped
        if u32::from(self.ts) > self.ts_fpga & 0xff {
            base = base.saturating_sub(0x100);
        }
        base | u64::from(self.ts)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Packet {
    ChipData(ChipData),
    TestPulse { ts: u32 },
    CustomWord { message: u64, payload: u8 },
    TimestampOverflow,
}

impl Packet {
    /// Classify and decode a raw FIFO packet by its top nibble
    #[must_use]
    pub fn decode(word: u64) -> Self {
        match word >> 60 {
            0xf => Packet::TimestampOverflow,
            0xa => Packet::TestPulse {
                ts: field(word, 0, 24) as u32,
            },
            0xc => Packet::CustomWord {
                message: field(word, 8, 48),
                payload: field(word, 0, 8) as u8,
            },
            _ => Packet::ChipData(ChipData::decode(word)),
        }
    }
}

/// Decodes a run of packets, counting board timestamp overflows along the way.
/// Yields every packet other than the overflows together with the overflow count at that point.
#[derive(Debug, Clone)]
pub struct Sequence<I> {
    packets: I,
    overflows: u64,
}

impl<I> Sequence<I>
where
    I: Iterator<Item = u64>,
{
    pub fn new(packets: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            packets: packets.into_iter(),
            overflows: 0,
        }
    }

    #[must_use]
    pub fn overflows(&self) -> u64 {
        self.overflows
    }
}

impl<I> Iterator for Sequence<I>
where
    I: Iterator<Item = u64>,
{
    type Item = (u64, Packet);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match Packet::decode(self.packets.next()?) {
                Packet::TimestampOverflow => self.overflows += 1,
                packet => return Some((self.overflows, packet)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_chip_data() {
        // ser 3, ts_fpga 0x123456, ts 0x78, sec 5, col 9, corepr 0x21, hitmap 0x81, bottom
        let word: u64 = (3 << 56) | (0x12_3456 << 32) | (0x78 << 24) | (0x59 << 16) | (0x21 << 9)
            | (0x81 << 1)
            | 1;
        let Packet::ChipData(data) = Packet::decode(word) else {
            panic!("Wrong packet type");
        };
        assert_eq!(data, ChipData {
            bottom: true,
            hitmap: 0x81,
            corepr: 0x21,
            col: 9,
            sec: 5,
            ts: 0x78,
            ts_fpga: 0x12_3456,
            ser: 3,
        });
        assert_eq!(data.master_index(), (5 * 16 + 9) * 128 + 0x21);
    }

    #[test]
    fn test_pixels() {
        let data = ChipData {
            bottom: false,
            hitmap: 0b1000_0001,
            corepr: 3,
            col: 2,
            sec: 1,
            ts: 0,
            ts_fpga: 0,
            ser: 0,
        };
        let pixels = data.pixels().unwrap();
        assert_eq!(pixels, vec![Pixel { row: 16, col: 36 }, Pixel { row: 15, col: 37 }]);
        assert_eq!(pixels[0].section(), 1);
        assert_eq!(pixels[0].double_column(), 2);
        assert_eq!(pixels[1].core_pr(), 3);
        assert!(pixels[1].master());
        assert_eq!(pixels[0].index(), 0);
        assert_eq!(pixels[1].index(), 3);
        let oob = ChipData {
            corepr: 127,
            hitmap: 1,
            ..data
        };
        assert_eq!(oob.pixels(), Err(Error::OutOfBounds { row: 512, col: 36 }));
    }

    #[test]
    fn test_other_packets() {
        assert_eq!(Packet::decode(0xa000_0000_0012_3456), Packet::TestPulse {
            ts: 0x12_3456
        });
        assert_eq!(Packet::decode(0xc012_3456_789a_bccd), Packet::CustomWord {
            message: 0x1234_5678_9abc,
            payload: 0xcd
        });
        assert_eq!(Packet::decode(0xf000_0000_0000_0000), Packet::TimestampOverflow);
    }

    #[test]
    fn test_extended_timestamp() {
        let data = ChipData::decode((0x00_1205 << 32) | (0x04 << 24));
        assert_eq!(data.extended_timestamp(2), (2 << 24) | 0x1204);
        // Chip latched 0xfe just before the board's low byte wrapped to 0x05
        let data = ChipData::decode((0x00_1205 << 32) | (0xfe << 24));
        assert_eq!(data.extended_timestamp(0), 0x11fe);
    }

    #[test]
    fn test_sequence() {
        let words = [
            0xa000_0000_0000_0001,
            0xf000_0000_0000_0000,
            0xf000_0000_0000_0000,
            0xa000_0000_0000_0002,
        ];
        let decoded: Vec<_> = Sequence::new(words).collect();
        assert_eq!(decoded, vec![
            (0, Packet::TestPulse { ts: 1 }),
            (2, Packet::TestPulse { ts: 2 }),
        ]);
    }
}
