//! page/checksum — 16-байтовый трейлер страницы.
//!
//! - trailer[0..4] — CRC32C (LE) по всей странице с занулённым трейлером;
//! - trailer[4..16] — нули (резерв).
//!
//! Update/verify считают CRC над копией с занулённым трейлером — данные
//! страницы не изменяются при verify.

use byteorder::{ByteOrder, LittleEndian};

use crate::errors::{ObexError, Result};
use super::common::TRAILER_LEN;

#[inline]
fn compute_crc32c_zeroed_trailer(page: &[u8]) -> u32 {
    let ps = page.len();
    let mut tmp = page.to_vec();
    for b in &mut tmp[ps - TRAILER_LEN..ps] {
        *b = 0;
    }
    crc32c::crc32c(&tmp)
}

/// Проставить трейлер чексуммы страницы.
pub fn page_update_checksum(page: &mut [u8]) -> Result<()> {
    if page.len() < TRAILER_LEN {
        return Err(ObexError::corruption("page buffer too small for checksum"));
    }
    let crc = compute_crc32c_zeroed_trailer(page);
    let ps = page.len();
    for b in &mut page[ps - TRAILER_LEN..ps] {
        *b = 0;
    }
    LittleEndian::write_u32(&mut page[ps - TRAILER_LEN..ps - TRAILER_LEN + 4], crc);
    Ok(())
}

/// Проверить трейлер. true = чексумма сошлась.
pub fn page_verify_checksum(page: &[u8]) -> Result<bool> {
    if page.len() < TRAILER_LEN {
        return Err(ObexError::corruption("page buffer too small for checksum"));
    }
    let ps = page.len();
    let stored = LittleEndian::read_u32(&page[ps - TRAILER_LEN..ps - TRAILER_LEN + 4]);
    let calc = compute_crc32c_zeroed_trailer(page);
    Ok(stored == calc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_roundtrip_and_detects_flip() {
        let mut page = vec![0u8; 4096];
        page[100] = 0xAB;
        page_update_checksum(&mut page).unwrap();
        assert!(page_verify_checksum(&page).unwrap());

        page[200] ^= 0x01;
        assert!(!page_verify_checksum(&page).unwrap());
    }
}
