//! Row-pitch helpers for texture readback.
//!
//! GPU copies into buffers require each row to start on a 256-byte boundary.
//! Staging buffers are sized with [`padded_bytes_per_row`] and the padding is
//! stripped with [`unpad_rows`] once the data is mapped.

/// Row alignment required by texture-to-buffer copies.
pub const COPY_ROW_ALIGNMENT: u32 = 256;

/// Bytes per row rounded up to [`COPY_ROW_ALIGNMENT`].
#[must_use]
pub fn padded_bytes_per_row(width: u32, bytes_per_texel: u32) -> u32 {
    (width * bytes_per_texel).div_ceil(COPY_ROW_ALIGNMENT) * COPY_ROW_ALIGNMENT
}

/// Strip row padding, returning `rows` tightly packed rows of
/// `row_bytes` each. Missing trailing data is treated as zero.
#[must_use]
pub fn unpad_rows(data: &[u8], row_bytes: u32, padded_row_bytes: u32, rows: u32) -> Vec<u8> {
    let row_bytes = row_bytes as usize;
    let padded = padded_row_bytes as usize;
    let mut out = vec![0u8; row_bytes * rows as usize];
    for (row, dst) in out.chunks_exact_mut(row_bytes).enumerate() {
        let start = row * padded;
        if start >= data.len() {
            break;
        }
        let end = (start + row_bytes).min(data.len());
        dst[..end - start].copy_from_slice(&data[start..end]);
    }
    out
}
