//! SPB delta-coded 3-plane images and their 24-bpp BMP wrapping.
//!
//! The format header is only `u16_be width, u16_be height`; the body is one
//! continuous bitstream carrying three 8-bit planes. Each plane starts with a
//! seed byte, then groups of four pixels driven by a 3-bit control code:
//! 0 stamps the current value four times, 6 reads four absolute bytes, and
//! the rest select a delta width (7 escapes to a 1-bit read for widths 1-2).

use std::time::{Duration, Instant};

use crate::bits::{BitReader, EndOfData};
use crate::error::{Error, Result};

pub const MAX_WIDTH: u32 = 8192;
pub const MAX_HEIGHT: u32 = 8192;
/// 16 MP cap; avoids pathological allocations from garbage headers.
pub const MAX_PIXELS: u32 = 4096 * 4096;

/// Pixel-order mapping of a decoded plane into the output rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpbScan {
    /// Forward row, reverse row, alternating; trailing forward row when the
    /// height is odd.
    Zigzag,
    /// Left-to-right, top-to-bottom.
    Linear,
}

/// Which output channel the first decoded plane lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpbPlane {
    /// First plane is B, then G, then R (the format's native order).
    Bgr,
    /// First plane is R, then G, then B.
    Rgb,
}

/// Cheap header sanity check: both dimensions in bounds and the pixel count
/// under the cap. Returns the (possibly implausible) dimensions either way.
pub fn spb_plausible(raw: &[u8]) -> (bool, u32, u32) {
    if raw.len() < 4 {
        return (false, 0, 0);
    }
    let w = u16::from_be_bytes([raw[0], raw[1]]) as u32;
    let h = u16::from_be_bytes([raw[2], raw[3]]) as u32;
    if !(1..=MAX_WIDTH).contains(&w) || !(1..=MAX_HEIGHT).contains(&h) {
        return (false, w, h);
    }
    if w * h > MAX_PIXELS {
        return (false, w, h);
    }
    (true, w, h)
}

/// Size of the 24-bpp BMP a `w`x`h` image converts to: 54-byte header plus
/// rows padded to 4-byte boundaries.
pub fn expected_24bpp_bmp_size(w: u32, h: u32) -> usize {
    let row = w as usize * 3;
    let pad = (4 - (row % 4)) % 4;
    14 + 40 + h as usize * (row + pad)
}

enum PlaneStop {
    Eof,
    Timeout,
}

impl From<EndOfData> for PlaneStop {
    fn from(_: EndOfData) -> Self {
        PlaneStop::Eof
    }
}

/// Convert an SPB payload to a bottom-up 24-bpp BMP.
///
/// `timeout` is a cooperative wall-clock budget checked every ~16 K emitted
/// pixels; `None` disables it. Truncated bitstreams are not an error: each
/// plane is padded with its last decoded value.
pub fn decode_spb(
    spb: &[u8],
    timeout: Option<Duration>,
    scan: SpbScan,
    plane: SpbPlane,
) -> Result<Vec<u8>> {
    if spb.len() < 4 {
        return Err(Error::Decode("SPB too short"));
    }
    let width = u16::from_be_bytes([spb[0], spb[1]]) as u32;
    let height = u16::from_be_bytes([spb[2], spb[3]]) as u32;
    if !(1..=MAX_WIDTH).contains(&width)
        || !(1..=MAX_HEIGHT).contains(&height)
        || width * height > MAX_PIXELS
    {
        return Err(Error::InvalidSpb { width, height });
    }
    let pix_count = (width * height) as usize;

    let mut tmp = vec![0u8; pix_count];
    let mut rgb = vec![0u8; pix_count * 3];

    let mut br = BitReader::new(spb, 4);
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut check_counter: u32 = 0;

    let plane_order: [usize; 3] = match plane {
        SpbPlane::Rgb => [0, 1, 2],
        SpbPlane::Bgr => [2, 1, 0],
    };

    for plane_idx in plane_order {
        decode_plane(&mut br, &mut tmp, deadline, &mut check_counter)?;
        map_plane(&tmp, &mut rgb, width as usize, plane_idx, scan);
    }

    Ok(wrap_bmp(&rgb, width, height))
}

fn decode_plane(
    br: &mut BitReader<'_>,
    tmp: &mut [u8],
    deadline: Option<Instant>,
    check_counter: &mut u32,
) -> Result<()> {
    let pix_count = tmp.len();
    let mut ch = br.get_u8().unwrap_or(0);
    tmp[0] = ch;
    let mut dest = 1usize;

    match plane_body(br, tmp, &mut ch, &mut dest, deadline, check_counter) {
        Ok(()) => Ok(()),
        Err(PlaneStop::Eof) => {
            for b in &mut tmp[dest..pix_count] {
                *b = ch;
            }
            Ok(())
        }
        Err(PlaneStop::Timeout) => Err(Error::Timeout),
    }
}

fn plane_body(
    br: &mut BitReader<'_>,
    tmp: &mut [u8],
    ch: &mut u8,
    dest: &mut usize,
    deadline: Option<Instant>,
    check_counter: &mut u32,
) -> std::result::Result<(), PlaneStop> {
    let pix_count = tmp.len();
    while *dest < pix_count {
        *check_counter += 1;
        if *check_counter & 0x3FFF == 0 {
            if let Some(d) = deadline {
                if Instant::now() > d {
                    return Err(PlaneStop::Timeout);
                }
            }
        }

        let nbit = br.get_bits(3)?;
        if nbit == 0 {
            let run = 4.min(pix_count - *dest);
            for b in &mut tmp[*dest..*dest + run] {
                *b = *ch;
            }
            *dest += run;
            continue;
        }
        let mask = if nbit == 7 {
            br.get_bits(1)? + 1
        } else {
            nbit + 2
        };
        for _ in 0..4 {
            if mask == 8 {
                *ch = br.get_u8()?;
            } else {
                let t = br.get_bits(mask)?;
                *ch = if t & 1 != 0 {
                    ch.wrapping_add((t >> 1) as u8 + 1)
                } else {
                    ch.wrapping_sub((t >> 1) as u8)
                };
            }
            if *dest >= pix_count {
                break;
            }
            tmp[*dest] = *ch;
            *dest += 1;
        }
    }
    Ok(())
}

fn map_plane(tmp: &[u8], rgb: &mut [u8], width: usize, plane_idx: usize, scan: SpbScan) {
    for (p, &v) in tmp.iter().enumerate() {
        let y = p / width;
        let x = p % width;
        let col = match scan {
            SpbScan::Linear => x,
            SpbScan::Zigzag => {
                if y & 1 == 1 {
                    width - 1 - x
                } else {
                    x
                }
            }
        };
        rgb[(y * width + col) * 3 + plane_idx] = v;
    }
}

/// Wrap interleaved BGR/RGB bytes as a bottom-up 24-bpp BMP with rows padded
/// to 4-byte boundaries. All header fields little-endian, pixel offset 54.
fn wrap_bmp(rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
    let row_bytes = width as usize * 3;
    let pad = (4 - (row_bytes % 4)) % 4;
    let dst_row_len = row_bytes + pad;
    let file_size = 14 + 40 + dst_row_len * height as usize;

    let mut out = vec![0u8; file_size];
    out[0] = b'B';
    out[1] = b'M';
    out[2..6].copy_from_slice(&(file_size as u32).to_le_bytes());
    out[10..14].copy_from_slice(&54u32.to_le_bytes());
    out[14..18].copy_from_slice(&40u32.to_le_bytes());
    out[18..22].copy_from_slice(&(width as i32).to_le_bytes());
    out[22..26].copy_from_slice(&(height as i32).to_le_bytes());
    out[26..28].copy_from_slice(&1u16.to_le_bytes());
    out[28..30].copy_from_slice(&24u16.to_le_bytes());

    for y in 0..height as usize {
        let src_off = (height as usize - 1 - y) * row_bytes;
        let dst_off = 54 + y * dst_row_len;
        out[dst_off..dst_off + row_bytes].copy_from_slice(&rgb[src_off..src_off + row_bytes]);
    }
    out
}
