//! The archive's LZSS variant: 1-bit literal/back-reference flags, 8-bit
//! ring offsets, 4-bit lengths biased by 2, over a 256-byte ring buffer.

use crate::bits::BitReader;

const RING_SIZE: usize = 256;
const RING_START: usize = RING_SIZE - 17;

/// Decompress up to `out_size` bytes starting at `start_offset` in `data`.
///
/// Running out of input is not an error: the output accumulated so far is
/// returned, possibly shorter than `out_size`. Callers validate the result
/// (a BMP payload must still begin with `BM`).
pub fn decompress(data: &[u8], out_size: usize, start_offset: usize) -> Vec<u8> {
    let mut br = BitReader::new(data, start_offset);
    let mut ring = [0u8; RING_SIZE];
    let mut bufpos = RING_START;
    let mut out = Vec::with_capacity(out_size);

    'stream: while out.len() < out_size {
        let Ok(flag) = br.get_bits(1) else {
            break;
        };
        if flag != 0 {
            let Ok(ch) = br.get_u8() else {
                break;
            };
            ring[bufpos] = ch;
            bufpos = (bufpos + 1) & 0xFF;
            out.push(ch);
        } else {
            let Ok(offset) = br.get_u8() else {
                break;
            };
            let Ok(n) = br.get_bits(4) else {
                break;
            };
            let count = n as usize + 2;
            for k in 0..count {
                let ch = ring[(offset as usize + k) & 0xFF];
                ring[bufpos] = ch;
                bufpos = (bufpos + 1) & 0xFF;
                out.push(ch);
                if out.len() >= out_size {
                    break 'stream;
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::tests_support::BitWriter;

    #[test]
    fn literals_only() {
        let mut bw = BitWriter::new();
        for &b in b"BM\x00\x01" {
            bw.put_bits(1, 1);
            bw.put_bits(b as u32, 8);
        }
        let out = decompress(&bw.finish(), 4, 0);
        assert_eq!(out, b"BM\x00\x01");
    }

    #[test]
    fn backref_copies_from_ring() {
        // Two literals land at ring positions 239 and 240, then a
        // back-reference replays them (offset 239, count 2+0).
        let mut bw = BitWriter::new();
        bw.put_bits(1, 1);
        bw.put_bits(b'A' as u32, 8);
        bw.put_bits(1, 1);
        bw.put_bits(b'B' as u32, 8);
        bw.put_bits(0, 1);
        bw.put_bits(239, 8);
        bw.put_bits(0, 4);
        let out = decompress(&bw.finish(), 4, 0);
        assert_eq!(out, b"ABAB");
    }

    #[test]
    fn backref_stops_at_out_size() {
        let mut bw = BitWriter::new();
        bw.put_bits(1, 1);
        bw.put_bits(0x7F, 8);
        bw.put_bits(0, 1);
        bw.put_bits(239, 8);
        bw.put_bits(0xF, 4); // would copy 17 bytes
        let out = decompress(&bw.finish(), 3, 0);
        assert_eq!(out, &[0x7F, 0x7F, 0x7F]);
    }

    #[test]
    fn truncated_input_returns_partial_output() {
        let mut bw = BitWriter::new();
        bw.put_bits(1, 1);
        bw.put_bits(b'X' as u32, 8);
        let out = decompress(&bw.finish(), 100, 0);
        // One literal, then the flag-bit read drains padding and the
        // stream ends short of the target.
        assert!(out.len() < 100);
        assert_eq!(out[0], b'X');
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(decompress(&[], 16, 0).is_empty());
    }
}
