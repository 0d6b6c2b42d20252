//! Guest software loading: bzImage kernel, ramdisk and boot arguments are
//! placed into guest RAM and described to the guest through the zero page.

use std::io::Read;

use log::info;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::ioctl_defs::{AcrnGpRegs, AcrnRegs, AcrnVcpuRegs};
use crate::vmmapi::VmCtx;
use crate::{GB, KB, MB};

const SETUP_SIG: u32 = 0x5a5a_aa55;

/* E820 memory types */
pub const E820_TYPE_RAM: u32 = 1;
pub const E820_TYPE_RESERVED: u32 = 2;

pub const NUM_E820_ENTRIES: usize = 4;

/* Load layout within lowmem; see the e820 mapping below. */
fn ramdisk_load_off(lowmem: u64) -> u64 {
    lowmem - 4 * MB
}
fn bootargs_load_off(lowmem: u64) -> u64 {
    lowmem - 8 * KB
}
fn zeropage_load_off(lowmem: u64) -> u64 {
    lowmem - 4 * KB
}
const KERNEL_LOAD_OFF: u64 = 16 * MB;

#[derive(Debug, thiserror::Error)]
pub enum SwLoadError {
    #[error("can't open kernel image: {0}")]
    KernelImage(std::io::Error),
    #[error("can't open ramdisk image: {0}")]
    RamdiskImage(std::io::Error),
    #[error("could not get setup size in kernel image")]
    NoSetupSig,
    #[error("image does not fit into guest memory")]
    TooBig,
    #[error("bootargs too long")]
    BootargsTooLong,
    #[error(transparent)]
    Vmm(#[from] crate::vmmapi::VmmError),
}

pub type Result<T> = std::result::Result<T, SwLoadError>;

/// Defines a single entry in an E820 memory map.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct E820Entry {
    pub baseaddr: u64,
    pub length: u64,
    pub type_: u32,
}

/// The real-mode kernel zero page, refer to Documentation/x86/boot.txt.
/// Every multi-byte field lands naturally aligned, the explicit pads keep
/// the architectural offsets.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ZeroPage {
    pad1: [u8; 0x1e8],
    pub e820_nentries: u8,  /* 0x1e8 */
    pad2: [u8; 0x8],
    /* setup header, 0x1f1 */
    hdr_pad1: [u8; 0x1f],
    pub loader_type: u8,    /* 0x210 */
    pub load_flags: u8,     /* 0x211 */
    hdr_pad2: [u8; 0x2],
    pub code32_start: u32,  /* 0x214 */
    pub ramdisk_addr: u32,  /* 0x218 */
    pub ramdisk_size: u32,  /* 0x21c */
    hdr_pad3: [u8; 0x8],
    pub bootargs_addr: u32, /* 0x228 */
    hdr_pad4: [u8; 0x3c],
    pad3: [u8; 0x68],
    pub e820: [E820Entry; 0x80], /* 0x2d0 */
    pad4: [u8; 0x330],
}

/// Guest software images, from the command line.
#[derive(Default, Clone)]
pub struct SwLoadConfig {
    pub kernel_path: Option<String>,
    pub ramdisk_path: Option<String>,
    pub bootargs: Option<String>,
}

impl SwLoadConfig {
    pub fn parse_kernel(&mut self, arg: &str) -> Result<()> {
        std::fs::File::open(arg).map_err(SwLoadError::KernelImage)?;
        self.kernel_path = Some(arg.to_string());
        Ok(())
    }

    pub fn parse_ramdisk(&mut self, arg: &str) -> Result<()> {
        std::fs::File::open(arg).map_err(SwLoadError::RamdiskImage)?;
        self.ramdisk_path = Some(arg.to_string());
        Ok(())
    }

    pub fn parse_bootargs(&mut self, arg: &str) -> Result<()> {
        if arg.len() >= 4 * KB as usize {
            return Err(SwLoadError::BootargsTooLong);
        }
        self.bootargs = Some(arg.to_string());
        Ok(())
    }
}

/// There is no separate firmware volume when direct-booting a bzImage.
pub fn high_bios_size() -> u64 {
    0
}

/// Default e820 map:
///
/// ```text
///             Begin      End        Type        Length
/// 0:             0 -     lowmem     RAM         lowmem
/// 1:        lowmem -     bfffffff   reserved    0xc0000000-lowmem
/// 2:    0xe0000000 -     ffffffff   reserved    512 MB
/// 3:   0x100000000 -     highmem    RAM         highmem (when present)
/// ```
pub fn create_e820_table(lowmem: u64, highmem: u64, highmem_gpa_base: u64) -> [E820Entry; NUM_E820_ENTRIES] {
    [
        E820Entry {
            baseaddr: 0,
            length: lowmem,
            type_: E820_TYPE_RAM,
        },
        E820Entry {
            baseaddr: lowmem,
            length: 0xC000_0000 - lowmem,
            type_: E820_TYPE_RESERVED,
        },
        E820Entry {
            baseaddr: 0xE000_0000,
            length: 0x2000_0000,
            type_: E820_TYPE_RESERVED,
        },
        if highmem > 0 {
            E820Entry {
                baseaddr: highmem_gpa_base,
                length: highmem,
                type_: E820_TYPE_RAM,
            }
        } else {
            E820Entry {
                baseaddr: highmem_gpa_base,
                length: 0x0010_0000,
                type_: E820_TYPE_RESERVED,
            }
        },
    ]
}

/// Locate the end of the real-mode setup code by scanning for the setup
/// signature; at least 1024 bytes, below 0x8000.
fn bzimage_setup_size(image: &[u8]) -> Result<u64> {
    let mut location: usize = 1024;
    while location + 4 <= image.len().min(0x8000) {
        let word = u32::from_le_bytes(image[location..location + 4].try_into().unwrap());
        if word == SETUP_SIG {
            break;
        }
        location += 4;
    }
    if location <= 1024 || location >= 0x8000 {
        return Err(SwLoadError::NoSetupSig);
    }
    let setup_sectors = (location + 511) / 512;
    let size = (setup_sectors * 512) as u64;
    info!(
        "SW_LOAD: found setup sig @ 0x{:08x}, setup_size is 0x{:08x}",
        location, size
    );
    Ok(size)
}

fn read_file(path: &str, err: fn(std::io::Error) -> SwLoadError) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    std::fs::File::open(path)
        .and_then(|mut f| f.read_to_end(&mut buf))
        .map_err(err)?;
    Ok(buf)
}

/// Flat 32-bit protected-mode register state entering the kernel at `rip`
/// with the zero page in rsi.
fn bsp_regs_for_entry(rip: u64, zeropage_gpa: u64) -> AcrnVcpuRegs {
    let mut regs = AcrnRegs::new_zeroed();
    regs.gprs = AcrnGpRegs::new_zeroed();
    regs.gprs.rsi = zeropage_gpa;
    regs.rip = rip;
    regs.rflags = 0x2;
    regs.cr0 = 0x1; /* PE */
    regs.cs_ar = 0xC09B;
    regs.cs_limit = 0xFFFF_FFFF;
    regs.cs_sel = 0x10;
    regs.ss_sel = 0x18;
    regs.ds_sel = 0x18;
    regs.es_sel = 0x18;
    regs.fs_sel = 0x18;
    regs.gs_sel = 0x18;

    AcrnVcpuRegs {
        vcpu_id: 0,
        reserved0: [0; 3],
        vcpu_regs: regs,
    }
}

/// Copy kernel/ramdisk/bootargs into guest RAM, build the zero page and
/// return the BSP register block to run it.
pub fn sw_load_bzimage(ctx: &VmCtx, cfg: &SwLoadConfig) -> Result<AcrnVcpuRegs> {
    let kernel_path = cfg
        .kernel_path
        .as_deref()
        .ok_or_else(|| SwLoadError::KernelImage(std::io::ErrorKind::NotFound.into()))?;
    let kernel = read_file(kernel_path, SwLoadError::KernelImage)?;
    let setup_size = bzimage_setup_size(&kernel)?;

    let lowmem = ctx.lowmem;
    if KERNEL_LOAD_OFF + kernel.len() as u64 > ramdisk_load_off(lowmem) {
        return Err(SwLoadError::TooBig);
    }

    ctx.write_gpa(KERNEL_LOAD_OFF, &kernel)?;
    info!(
        "SW_LOAD: kernel loaded @ 0x{:x}, size 0x{:x}",
        KERNEL_LOAD_OFF,
        kernel.len()
    );

    let mut zeropage = ZeroPage::new_zeroed();

    /* carry the setup header over from the image */
    let hdr_start = 0x1f1usize;
    let hdr_end = 0x268usize.min(kernel.len());
    zeropage.as_mut_bytes()[hdr_start..hdr_end].copy_from_slice(&kernel[hdr_start..hdr_end]);

    if let Some(ramdisk_path) = cfg.ramdisk_path.as_deref() {
        let ramdisk = read_file(ramdisk_path, SwLoadError::RamdiskImage)?;
        let off = ramdisk_load_off(lowmem);
        if off + ramdisk.len() as u64 > bootargs_load_off(lowmem) {
            return Err(SwLoadError::TooBig);
        }
        ctx.write_gpa(off, &ramdisk)?;
        zeropage.ramdisk_addr = off as u32;
        zeropage.ramdisk_size = ramdisk.len() as u32;
        info!("SW_LOAD: ramdisk loaded @ 0x{off:x}, size 0x{:x}", ramdisk.len());
    }

    if let Some(bootargs) = cfg.bootargs.as_deref() {
        let off = bootargs_load_off(lowmem);
        let mut bytes = bootargs.as_bytes().to_vec();
        bytes.push(0);
        ctx.write_gpa(off, &bytes)?;
        zeropage.bootargs_addr = off as u32;
        info!("SW_LOAD: bootargs \"{bootargs}\" @ 0x{off:x}");
    }

    /* unknown loader type; the kernel skips loader-specific quirks */
    zeropage.loader_type = 0xff;

    let e820 = create_e820_table(lowmem, ctx.highmem, ctx.highmem_gpa_base);
    zeropage.e820_nentries = NUM_E820_ENTRIES as u8;
    zeropage.e820[..NUM_E820_ENTRIES].copy_from_slice(&e820);

    let entry = KERNEL_LOAD_OFF + setup_size;
    zeropage.code32_start = entry as u32;

    let zp_off = zeropage_load_off(lowmem);
    ctx.write_gpa(zp_off, zeropage.as_bytes())?;

    info!("SW_LOAD: bzImage entry @ 0x{entry:x}, zero page @ 0x{zp_off:x}");
    Ok(bsp_regs_for_entry(entry, zp_off))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeropage_field_offsets() {
        assert_eq!(std::mem::size_of::<ZeroPage>(), 4096);
        assert_eq!(std::mem::offset_of!(ZeroPage, e820_nentries), 0x1e8);
        assert_eq!(std::mem::offset_of!(ZeroPage, loader_type), 0x210);
        assert_eq!(std::mem::offset_of!(ZeroPage, code32_start), 0x214);
        assert_eq!(std::mem::offset_of!(ZeroPage, ramdisk_addr), 0x218);
        assert_eq!(std::mem::offset_of!(ZeroPage, bootargs_addr), 0x228);
        assert_eq!(std::mem::offset_of!(ZeroPage, e820), 0x2d0);
    }

    #[test]
    fn e820_template_without_highmem() {
        let e820 = create_e820_table(2 * GB, 0, 4 * GB);
        let (t0, len0) = (e820[0].type_, e820[0].length);
        assert_eq!(t0, E820_TYPE_RAM);
        assert_eq!(len0, 2 * GB);
        let (t1, base1, len1) = (e820[1].type_, e820[1].baseaddr, e820[1].length);
        assert_eq!(t1, E820_TYPE_RESERVED);
        assert_eq!(base1, 2 * GB);
        assert_eq!(len1, 0xC000_0000 - 2 * GB);
        let base2 = e820[2].baseaddr;
        assert_eq!(base2, 0xE000_0000);
        let t3 = e820[3].type_;
        assert_eq!(t3, E820_TYPE_RESERVED);
    }

    #[test]
    fn e820_template_with_highmem() {
        let e820 = create_e820_table(3 * GB, GB, 4 * GB);
        let (t3, base3, len3) = (e820[3].type_, e820[3].baseaddr, e820[3].length);
        assert_eq!(t3, E820_TYPE_RAM);
        assert_eq!(base3, 4 * GB);
        assert_eq!(len3, GB);
    }

    #[test]
    fn setup_size_from_signature() {
        let mut image = vec![0u8; 0x4000];
        // place the signature 3 sectors in
        let loc = 1500usize;
        image[loc..loc + 4].copy_from_slice(&SETUP_SIG.to_le_bytes());
        let size = bzimage_setup_size(&image).unwrap();
        assert_eq!(size, 1536);
    }

    #[test]
    fn setup_sig_missing_is_an_error() {
        let image = vec![0u8; 0x9000];
        assert!(bzimage_setup_size(&image).is_err());
    }
}
