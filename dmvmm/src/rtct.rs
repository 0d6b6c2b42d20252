//! Software-SRAM table (RTCT/PTCT) handling: checksum-verify the platform
//! table and rewrite the SSRAM base addresses so the guest sees the region
//! just below 2 GiB.

use log::{info, warn};

const RTCT_PATH: &str = "/sys/firmware/acpi/tables/RTCT";
const PTCT_PATH: &str = "/sys/firmware/acpi/tables/PTCT";

const ACPI_HEADER_LEN: usize = 36;
const CHECKSUM_OFFSET: usize = 9;
const ENTRY_HEADER_LEN: usize = 8;

/* v1 entry types */
const RTCT_V1_SSRAM: u32 = 5;
/* v2 entry types */
const RTCT_V2_COMPATIBILITY: u32 = 0;
const RTCT_V2_SSRAM: u32 = 7;

/// Guest window for software SRAM, just below the 2 GiB line.
pub const SOFTWARE_SRAM_BASE_GPA: u64 = 0x7FC0_0000;

#[derive(Debug, thiserror::Error)]
pub enum RtctError {
    #[error("can't read RTCT: {0}")]
    Read(std::io::Error),
    #[error("RTCT checksum mismatch")]
    Checksum,
    #[error("malformed RTCT")]
    Malformed,
}

pub type Result<T> = std::result::Result<T, RtctError>;

fn table_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn fixup_checksum(data: &mut [u8]) {
    data[CHECKSUM_OFFSET] = 0;
    let sum = table_checksum(data);
    data[CHECKSUM_OFFSET] = 0u8.wrapping_sub(sum);
}

struct EntryRef {
    offset: usize,
    size: usize,
    type_: u32,
}

fn entries(data: &[u8]) -> Result<Vec<EntryRef>> {
    if data.len() < ACPI_HEADER_LEN {
        return Err(RtctError::Malformed);
    }
    let table_len = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
    if table_len > data.len() {
        return Err(RtctError::Malformed);
    }
    let mut out = Vec::new();
    let mut off = ACPI_HEADER_LEN;
    while off + ENTRY_HEADER_LEN <= table_len {
        let size = u16::from_le_bytes(data[off..off + 2].try_into().unwrap()) as usize;
        let type_ = u32::from_le_bytes(data[off + 4..off + 8].try_into().unwrap());
        if size < ENTRY_HEADER_LEN || off + size > table_len {
            return Err(RtctError::Malformed);
        }
        out.push(EntryRef {
            offset: off,
            size,
            type_,
        });
        off += size;
    }
    Ok(out)
}

fn is_v2(data: &[u8]) -> Result<bool> {
    Ok(entries(data)?
        .iter()
        .any(|e| e.type_ == RTCT_V2_COMPATIBILITY))
}

/* v1 ssram data: cache_level u32, base u64, ways u32, size u32, apic ids.
 * v2 ssram data: cache_level u32, cache_id u32, base u64, size u32, shared. */
fn ssram_fields(version2: bool, entry: &EntryRef) -> (usize, usize) {
    if version2 {
        (entry.offset + ENTRY_HEADER_LEN + 8, entry.offset + ENTRY_HEADER_LEN + 16)
    } else {
        (entry.offset + ENTRY_HEADER_LEN + 4, entry.offset + ENTRY_HEADER_LEN + 16)
    }
}

/// A software-SRAM region in both address spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SsramRegion {
    pub hpa: u64,
    pub gpa: u64,
    pub size: u64,
}

/// Verify the table checksum and rewrite every SSRAM base to the guest
/// window; returns the regions in table order. The rewritten table is
/// handed to the guest as its RTCT.
pub fn remap_software_sram(data: &mut [u8]) -> Result<Vec<SsramRegion>> {
    if table_checksum(data) != 0 {
        return Err(RtctError::Checksum);
    }

    let version2 = is_v2(data)?;
    let ssram_type = if version2 { RTCT_V2_SSRAM } else { RTCT_V1_SSRAM };

    let mut regions = Vec::new();
    let mut next_gpa = SOFTWARE_SRAM_BASE_GPA;
    for entry in entries(data)? {
        if entry.type_ != ssram_type {
            continue;
        }
        let (base_off, size_off) = ssram_fields(version2, &entry);
        if size_off + 4 > entry.offset + entry.size {
            return Err(RtctError::Malformed);
        }
        let hpa = u64::from_le_bytes(data[base_off..base_off + 8].try_into().unwrap());
        let size = u32::from_le_bytes(data[size_off..size_off + 4].try_into().unwrap()) as u64;

        data[base_off..base_off + 8].copy_from_slice(&next_gpa.to_le_bytes());
        regions.push(SsramRegion {
            hpa,
            gpa: next_gpa,
            size,
        });
        next_gpa += size;
    }

    fixup_checksum(data);
    info!(
        "software SRAM: {} region(s) mapped at {:#x} (v{})",
        regions.len(),
        SOFTWARE_SRAM_BASE_GPA,
        if version2 { 2 } else { 1 }
    );
    Ok(regions)
}

/// Read the platform RTCT (PTCT on older firmware).
pub fn load_platform_rtct() -> Result<Vec<u8>> {
    match std::fs::read(RTCT_PATH) {
        Ok(data) => Ok(data),
        Err(_) => {
            warn!("no RTCT, falling back to PTCT");
            std::fs::read(PTCT_PATH).map_err(RtctError::Read)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_entry(t: &mut Vec<u8>, type_: u32, data: &[u8]) {
        let size = (ENTRY_HEADER_LEN + data.len()) as u16;
        t.extend_from_slice(&size.to_le_bytes());
        t.extend_from_slice(&1u16.to_le_bytes());
        t.extend_from_slice(&type_.to_le_bytes());
        t.extend_from_slice(data);
    }

    fn finish(mut t: Vec<u8>) -> Vec<u8> {
        let len = t.len() as u32;
        t[4..8].copy_from_slice(&len.to_le_bytes());
        fixup_checksum(&mut t);
        t
    }

    fn v1_ssram(base: u64, size: u32) -> Vec<u8> {
        let mut d = Vec::new();
        d.extend_from_slice(&2u32.to_le_bytes()); // cache level
        d.extend_from_slice(&base.to_le_bytes());
        d.extend_from_slice(&0xffu32.to_le_bytes()); // ways
        d.extend_from_slice(&size.to_le_bytes());
        d
    }

    fn v2_ssram(base: u64, size: u32) -> Vec<u8> {
        let mut d = Vec::new();
        d.extend_from_slice(&2u32.to_le_bytes()); // cache level
        d.extend_from_slice(&0u32.to_le_bytes()); // cache id
        d.extend_from_slice(&base.to_le_bytes());
        d.extend_from_slice(&size.to_le_bytes());
        d.extend_from_slice(&0u32.to_le_bytes()); // shared
        d
    }

    #[test]
    fn v1_regions_are_remapped_in_order() {
        let mut t = vec![0u8; ACPI_HEADER_LEN];
        t[0..4].copy_from_slice(b"PTCT");
        push_entry(&mut t, RTCT_V1_SSRAM, &v1_ssram(0x1_0000_0000, 0x100000));
        push_entry(&mut t, RTCT_V1_SSRAM, &v1_ssram(0x2_0000_0000, 0x200000));
        let mut t = finish(t);

        let regions = remap_software_sram(&mut t).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].hpa, 0x1_0000_0000);
        assert_eq!(regions[0].gpa, SOFTWARE_SRAM_BASE_GPA);
        assert_eq!(regions[1].gpa, SOFTWARE_SRAM_BASE_GPA + 0x100000);
        // table was rewritten and re-checksummed
        assert_eq!(table_checksum(&t), 0);
        let e = entries(&t).unwrap();
        let (base_off, _) = ssram_fields(false, &e[0]);
        let new_base = u64::from_le_bytes(t[base_off..base_off + 8].try_into().unwrap());
        assert_eq!(new_base, SOFTWARE_SRAM_BASE_GPA);
    }

    #[test]
    fn v2_detection_via_compatibility_entry() {
        let mut t = vec![0u8; ACPI_HEADER_LEN];
        t[0..4].copy_from_slice(b"RTCT");
        push_entry(&mut t, RTCT_V2_COMPATIBILITY, &[0u8; 8]);
        push_entry(&mut t, RTCT_V2_SSRAM, &v2_ssram(0x8000_0000, 0x80000));
        let mut t = finish(t);

        let regions = remap_software_sram(&mut t).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].hpa, 0x8000_0000);
        assert_eq!(regions[0].gpa, SOFTWARE_SRAM_BASE_GPA);
    }

    #[test]
    fn bad_checksum_is_rejected() {
        let mut t = vec![0u8; ACPI_HEADER_LEN];
        t[0..4].copy_from_slice(b"RTCT");
        let mut t = finish(t);
        t[10] ^= 0xff;
        assert!(matches!(
            remap_software_sram(&mut t),
            Err(RtctError::Checksum)
        ));
    }
}
