use std::num::Wrapping;

use md4::{Digest, Md4};

// Rolling checksum of one block. Similar to Adler32 but cheaper; its weakness
// is balanced by the truncated MD4 confirmation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rsum {
    pub a: u16,
    pub b: u16,
}

impl Rsum {
    // Calculate the checksum of a whole block.
    pub fn calculate(data: &[u8]) -> Self {
        let mut a = Wrapping(0u16);
        let mut b = Wrapping(0u16);
        let mut rem = Wrapping(data.len() as u16);
        for &c in data {
            let c = Wrapping(u16::from(c));
            a += c;
            b += rem * c;
            rem -= Wrapping(1);
        }
        Rsum { a: a.0, b: b.0 }
    }

    // Slide the window forward by one byte: `old` leaves, `new` enters.
    // The old byte is scaled by 1 << block_shift, which equals the block size
    // whenever the block size is a power of two.
    pub fn update(self, old: u8, new: u8, block_shift: u32) -> Self {
        let a = self.a.wrapping_add(u16::from(new)).wrapping_sub(u16::from(old));
        let shifted = ((u64::from(old)) << block_shift) as u16;
        let b = self.b.wrapping_add(a).wrapping_sub(shifted);
        Rsum { a, b }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MD4Digest(pub [u8; 16]);

impl Default for MD4Digest {
    fn default() -> Self {
        MD4Digest([0; 16])
    }
}

impl From<[u8; 16]> for MD4Digest {
    fn from(x: [u8; 16]) -> Self {
        MD4Digest(x)
    }
}

impl MD4Digest {
    pub fn calculate(data: &[u8]) -> Self {
        let mut hasher = Md4::new();
        hasher.input(data);
        let mut result = MD4Digest([0; 16]);
        result.0.copy_from_slice(hasher.result().as_slice());
        result
    }
}

// An MD4 digest of which only the first `length` bytes are meaningful.
#[derive(Copy, Clone, Debug, Default)]
pub struct PartialChecksum {
    pub value: MD4Digest,
    pub length: usize,
}

impl PartialEq for PartialChecksum {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.length == other.length && self.value.0[..self.length] == other.value.0[..other.length]
    }
}

impl Eq for PartialChecksum {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsum_matches_definition() {
        // a = sum of bytes, b = sum of (len - i) * byte, both mod 2^16.
        let data = b"ABCD";
        let r = Rsum::calculate(data);
        assert_eq!(r.a, 65 + 66 + 67 + 68);
        assert_eq!(r.b, 4 * 65 + 3 * 66 + 2 * 67 + 68);
    }

    #[test]
    fn rsum_wraps() {
        let data = [0xffu8; 1024];
        let r = Rsum::calculate(&data);
        let mut a = 0u16;
        let mut b = 0u16;
        for i in 0..1024u32 {
            a = a.wrapping_add(0xff);
            b = b.wrapping_add((((1024 - i) * 0xff) & 0xffff) as u16);
        }
        assert_eq!(r, Rsum { a, b });
    }

    #[test]
    fn rsum_slide_equals_fresh() {
        // Sliding must agree with a fresh calculation at every position, for
        // power-of-two block sizes.
        let data: Vec<u8> = (0..256u32).map(|i| (i * 7 + 13) as u8).collect();
        for &bs in &[4usize, 8, 16] {
            let shift = bs.trailing_zeros();
            let mut r = Rsum::calculate(&data[..bs]);
            for p in 0..data.len() - bs {
                assert_eq!(r, Rsum::calculate(&data[p..p + bs]), "bs={} p={}", bs, p);
                r = r.update(data[p], data[p + bs], shift);
            }
        }
    }

    #[test]
    fn md4_known_vectors() {
        let hex = |d: MD4Digest| -> String {
            d.0.iter().map(|b| format!("{:02x}", b)).collect()
        };
        assert_eq!(hex(MD4Digest::calculate(b"")), "31d6cfe0d16ae931b73c59d7e0c089c0");
        assert_eq!(hex(MD4Digest::calculate(b"abc")), "a448017aaf21d8525fc10ae87aa6729d");
    }

    #[test]
    fn partial_checksum_compares_prefix_only() {
        let mut x = [1u8; 16];
        let mut y = [1u8; 16];
        y[5] = 9;
        x[15] = 3;
        let a = PartialChecksum { value: x.into(), length: 5 };
        let b = PartialChecksum { value: y.into(), length: 5 };
        assert_eq!(a, b);

        let c = PartialChecksum { value: y.into(), length: 6 };
        let d = PartialChecksum { value: x.into(), length: 6 };
        assert_ne!(c, d);
        assert_ne!(a, c);
    }
}
