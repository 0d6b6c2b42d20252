//! Platform LAPIC topology from the raw MADT, and the `--cpu_affinity`
//! option that is expressed in LAPIC ids on the command line.

use log::{error, warn};

use crate::ioctl_defs::ACRN_PLATFORM_LAPIC_IDS_MAX;

const MADT_PATH: &str = "/sys/firmware/acpi/tables/APIC";

const ACPI_HEADER_LEN: usize = 36;
const MADT_FIXED_LEN: usize = ACPI_HEADER_LEN + 8;
const MADT_TYPE_LOCAL_APIC: u8 = 0;
const LAPIC_FLAG_ENABLED: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum LapicError {
    #[error("can't read MADT: {0}")]
    Read(std::io::Error),
    #[error("malformed MADT")]
    Malformed,
    #[error("invalid cpu affinity option: {0}")]
    BadAffinity(String),
}

pub type Result<T> = std::result::Result<T, LapicError>;

/// pcpu-id -> LAPIC-id map, in MADT declaration order.
#[derive(Debug, Default, Clone)]
pub struct LapicMap {
    ids: Vec<u8>,
}

impl LapicMap {
    pub fn lapic_to_pcpu(&self, lapic_id: u8) -> Option<usize> {
        self.ids.iter().position(|&id| id == lapic_id)
    }

    pub fn pcpu_count(&self) -> usize {
        self.ids.len()
    }
}

/// Walk the raw MADT and collect the LAPIC ids of enabled processors.
pub fn parse_madt(data: &[u8]) -> Result<LapicMap> {
    if data.len() < MADT_FIXED_LEN {
        return Err(LapicError::Malformed);
    }
    let table_len = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
    if table_len > data.len() {
        return Err(LapicError::Malformed);
    }

    let mut ids = Vec::new();
    let mut off = MADT_FIXED_LEN;
    while off + 2 <= table_len {
        let etype = data[off];
        let elen = data[off + 1] as usize;
        if elen < 2 || off + elen > table_len {
            return Err(LapicError::Malformed);
        }
        if etype == MADT_TYPE_LOCAL_APIC && elen >= 8 {
            let apic_id = data[off + 3];
            let flags = u32::from_le_bytes(data[off + 4..off + 8].try_into().unwrap());
            if flags & LAPIC_FLAG_ENABLED != 0 && ids.len() < ACRN_PLATFORM_LAPIC_IDS_MAX {
                ids.push(apic_id);
            }
        }
        off += elen;
    }
    Ok(LapicMap { ids })
}

pub fn load_platform_lapic_ids() -> Result<LapicMap> {
    let data = std::fs::read(MADT_PATH).map_err(LapicError::Read)?;
    parse_madt(&data)
}

/// Parse `--cpu_affinity 1,2,3` (LAPIC ids) into a pcpu bitmap.
/// A repeated pcpu is logged and ignored, like any other already-claimed
/// processor.
pub fn parse_cpu_affinity(opt: &str, map: &LapicMap) -> Result<u64> {
    let mut bitmap: u64 = 0;
    for part in opt.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(LapicError::BadAffinity(opt.to_string()));
        }
        let lapic_id: u8 = part
            .parse()
            .map_err(|_| LapicError::BadAffinity(opt.to_string()))?;
        let pcpu = match map.lapic_to_pcpu(lapic_id) {
            Some(p) => p,
            None => {
                warn!("lapic id {lapic_id} not present, assuming pcpu 0");
                0
            }
        };
        if bitmap & (1u64 << pcpu) != 0 {
            error!("pcpu_id {pcpu} has been allocated to this VM.");
            continue;
        }
        bitmap |= 1u64 << pcpu;
    }
    Ok(bitmap)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_madt(lapics: &[(u8, u8, u32)]) -> Vec<u8> {
        let mut t = vec![0u8; MADT_FIXED_LEN];
        t[0..4].copy_from_slice(b"APIC");
        for &(uid, apic_id, flags) in lapics {
            t.extend_from_slice(&[MADT_TYPE_LOCAL_APIC, 8, uid, apic_id]);
            t.extend_from_slice(&flags.to_le_bytes());
        }
        let len = t.len() as u32;
        t[4..8].copy_from_slice(&len.to_le_bytes());
        t
    }

    #[test]
    fn enabled_lapics_populate_map() {
        let madt = fake_madt(&[(0, 0, 1), (1, 2, 1), (2, 4, 0), (3, 6, 1)]);
        let map = parse_madt(&madt).unwrap();
        assert_eq!(map.pcpu_count(), 3);
        assert_eq!(map.lapic_to_pcpu(0), Some(0));
        assert_eq!(map.lapic_to_pcpu(2), Some(1));
        // disabled lapic 4 is skipped, 6 takes its slot
        assert_eq!(map.lapic_to_pcpu(6), Some(2));
        assert_eq!(map.lapic_to_pcpu(4), None);
    }

    #[test]
    fn affinity_bitmap_and_duplicates() {
        let madt = fake_madt(&[(0, 0, 1), (1, 2, 1), (2, 4, 1)]);
        let map = parse_madt(&madt).unwrap();
        let bitmap = parse_cpu_affinity("0,4", &map).unwrap();
        assert_eq!(bitmap, 0b101);
        // a duplicate is ignored, not fatal
        let bitmap = parse_cpu_affinity("2,2", &map).unwrap();
        assert_eq!(bitmap, 0b010);
        assert!(parse_cpu_affinity("1,x", &map).is_err());
    }

    #[test]
    fn truncated_table_is_rejected() {
        assert!(parse_madt(&[0u8; 10]).is_err());
    }
}
