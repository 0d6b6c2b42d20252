//! Guest RAM backing on huge pages.
//!
//! Two tiers of sealable hugetlb memfds (2 MiB and 1 GiB) carry the guest
//! segments. Reservation raises `nr_hugepages` under a cross-process file
//! lock, folding 1 GiB shortfalls into the 2 MiB tier and releasing unused
//! 1 GiB pages when the small tier comes up short. Mappings are installed
//! MAP_FIXED into one guard VMA and pre-faulted by touching every page.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::process::Command;

use log::{error, info, warn};

use crate::{align_down, align_up, GB, MB};

pub const HUGETLB_LV1: usize = 0;
pub const HUGETLB_LV2: usize = 1;
pub const HUGETLB_LV_MAX: usize = 2;

const SYS_PATH_LV1: &str = "/sys/kernel/mm/hugepages/hugepages-2048kB/";
const SYS_PATH_LV2: &str = "/sys/kernel/mm/hugepages/hugepages-1048576kB/";
const SYS_NR_HUGEPAGES: &str = "nr_hugepages";
const SYS_FREE_HUGEPAGES: &str = "free_hugepages";

/* Lock between different processes accessing hugetlbfs. Allocating huge
 * pages from two processes at the same time can fail, so the whole
 * check-free/reserve/mmap sequence runs under this file lock. */
const HUGETLB_LOCK_FILE: &str = "/run/hugepage/acrn/lock";
const LOCK_OFFSET_END: libc::off_t = 10;

const MAX_MMAP_REGIONS: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum HugetlbError {
    #[error("memory size is not aligned to 2M")]
    Unaligned,
    #[error("vm requests 0 memory")]
    ZeroMemory,
    #[error("memfd_create: {0}")]
    Memfd(std::io::Error),
    #[error("hugetlb lock: {0}")]
    Lock(std::io::Error),
    #[error("not enough free huge pages")]
    ReserveFailed,
    #[error("mmap: {0}")]
    Mmap(std::io::Error),
    #[error("exceed supported mmap regions")]
    TooManyRegions,
    #[error("ftruncate/seal: {0}")]
    Seal(std::io::Error),
    #[error("{0}")]
    Sys(std::io::Error),
}

pub type Result<T> = std::result::Result<T, HugetlbError>;

/// How `nr_hugepages`/`free_hugepages` are read and written. The default
/// goes through sysfs; tests inject their own.
pub trait HugePagesBackend {
    fn nr_pages(&self, level: usize) -> i64;
    fn free_pages(&self, level: usize) -> i64;
    fn set_nr_pages(&mut self, level: usize, pages: i64);
}

pub struct SysfsPages {
    nr_paths: [String; HUGETLB_LV_MAX],
    free_paths: [String; HUGETLB_LV_MAX],
}

impl SysfsPages {
    pub fn new() -> SysfsPages {
        SysfsPages {
            nr_paths: [
                format!("{SYS_PATH_LV1}{SYS_NR_HUGEPAGES}"),
                format!("{SYS_PATH_LV2}{SYS_NR_HUGEPAGES}"),
            ],
            free_paths: [
                format!("{SYS_PATH_LV1}{SYS_FREE_HUGEPAGES}"),
                format!("{SYS_PATH_LV2}{SYS_FREE_HUGEPAGES}"),
            ],
        }
    }
}

impl Default for SysfsPages {
    fn default() -> Self {
        Self::new()
    }
}

fn read_sys_info(path: &str) -> i64 {
    match std::fs::read_to_string(path) {
        Ok(s) => s.trim().parse().unwrap_or_else(|_| {
            error!("bad page count in {path}");
            0
        }),
        Err(e) => {
            error!("can't open: {path}, err: {e}");
            0
        }
    }
}

impl HugePagesBackend for SysfsPages {
    fn nr_pages(&self, level: usize) -> i64 {
        read_sys_info(&self.nr_paths[level])
    }

    fn free_pages(&self, level: usize) -> i64 {
        read_sys_info(&self.free_paths[level])
    }

    fn set_nr_pages(&mut self, level: usize, pages: i64) {
        let cmd = format!("echo {} > {}", pages, self.nr_paths[level]);
        match Command::new("/bin/sh").arg("-c").arg(&cmd).status() {
            Ok(st) if st.success() => info!("to reserve pages: {cmd}"),
            _ => error!("cmd: {cmd} failed!"),
        }
    }
}

/// One guest segment's share of each tier, in bytes.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct TierSizes {
    pub lowmem: u64,
    pub fbmem: u64,
    pub biosmem: u64,
    pub highmem: u64,
}

impl TierSizes {
    fn total(&self) -> u64 {
        self.lowmem + self.fbmem + self.biosmem + self.highmem
    }
}

struct TierState {
    fd: RawFd,
    pg_size: u64,
    memfd_flags: libc::c_uint,
    sizes: TierSizes,
    pages_delta: i64,
    /* nr_hugepages this setup raised, so a failed setup can back out */
    pages_added: i64,
}

impl TierState {
    fn enabled_with(&self, sizes: &TierSizes) -> bool {
        self.fd >= 0 && sizes.total() > 0
    }
}

/// A recorded MAP_FIXED segment, used for DMA-buf re-export and direct
/// guest-memory access.
#[derive(Clone, Copy, Debug)]
pub struct MmapMemRegion {
    pub gpa_start: u64,
    pub gpa_end: u64,
    pub fd: RawFd,
    pub fd_offset: u64,
    pub hva: *mut u8,
}

/// Result of [`VmCtx::find_memfd_region`]: the backing fd and the offset of
/// the gpa within it.
#[derive(Clone, Copy, Debug)]
pub struct MemRegion {
    pub fd: RawFd,
    pub fd_offset: u64,
}

/// Split the four guest segments across the enabled tiers, largest pages
/// first; the remainder of each segment falls through to the next tier down.
pub fn split_tiers(
    lowmem: u64,
    fbmem: u64,
    biosmem: u64,
    highmem: u64,
    pg_sizes: &[u64; HUGETLB_LV_MAX],
    enabled: &[bool; HUGETLB_LV_MAX],
    lv_max: usize,
) -> [TierSizes; HUGETLB_LV_MAX] {
    let mut out = [TierSizes::default(); HUGETLB_LV_MAX];
    let (mut low, mut fb, mut bios, mut high) = (lowmem, fbmem, biosmem, highmem);

    for level in (0..lv_max).rev() {
        if !enabled[level] {
            continue;
        }
        let pg = pg_sizes[level];
        out[level] = TierSizes {
            lowmem: align_down(low, pg),
            fbmem: align_down(fb, pg),
            biosmem: align_down(bios, pg),
            highmem: align_down(high, pg),
        };
        if level > HUGETLB_LV1 {
            low -= out[level].lowmem;
            fb -= out[level].fbmem;
            bios -= out[level].biosmem;
            high -= out[level].highmem;
        }
    }
    out
}

pub struct HugetlbAllocator {
    tiers: [TierState; HUGETLB_LV_MAX],
    lv_max: usize,
    lock_file: File,
    backend: Box<dyn HugePagesBackend + Send>,
}

fn create_memfd(flags: libc::c_uint) -> std::io::Result<RawFd> {
    // SAFETY: plain syscall; name is a static nul-terminated string.
    let fd = unsafe { libc::memfd_create(c"acrn_memfd".as_ptr(), flags) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(fd)
}

impl HugetlbAllocator {
    pub fn new() -> Result<HugetlbAllocator> {
        Self::with_backend(Box::new(SysfsPages::new()), HUGETLB_LOCK_FILE)
    }

    pub fn with_backend(
        backend: Box<dyn HugePagesBackend + Send>,
        lock_path: &str,
    ) -> Result<HugetlbAllocator> {
        let flags_lv1 = libc::MFD_CLOEXEC
            | libc::MFD_ALLOW_SEALING
            | libc::MFD_HUGETLB
            | libc::MFD_HUGE_2MB;
        let flags_lv2 = libc::MFD_CLOEXEC
            | libc::MFD_ALLOW_SEALING
            | libc::MFD_HUGETLB
            | libc::MFD_HUGE_1GB;
        Self::with_backend_flags(backend, lock_path, flags_lv1, flags_lv2)
    }

    fn with_backend_flags(
        backend: Box<dyn HugePagesBackend + Send>,
        lock_path: &str,
        flags_lv1: libc::c_uint,
        flags_lv2: libc::c_uint,
    ) -> Result<HugetlbAllocator> {
        if let Some(dir) = std::path::Path::new(lock_path).parent() {
            // Multiple device-model instances may be booting VMs at the
            // same time, EEXIST is expected.
            if let Err(e) = std::fs::create_dir_all(dir) {
                if e.kind() != std::io::ErrorKind::AlreadyExists {
                    error!("mkdir {} failed: {e}", dir.display());
                    return Err(HugetlbError::Lock(e));
                }
            }
        }

        let fd1 = create_memfd(flags_lv1).map_err(HugetlbError::Memfd)?;
        let (fd2, lv_max) = match create_memfd(flags_lv2) {
            Ok(fd) => (fd, HUGETLB_LV_MAX),
            Err(_) => {
                warn!("WARNING: only level 1 hugetlb supported");
                (-1, HUGETLB_LV2)
            }
        };

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(lock_path)
            .map_err(HugetlbError::Lock)?;

        Ok(HugetlbAllocator {
            tiers: [
                TierState {
                    fd: fd1,
                    pg_size: 2 * MB,
                    memfd_flags: flags_lv1,
                    sizes: TierSizes::default(),
                    pages_delta: 0,
                    pages_added: 0,
                },
                TierState {
                    fd: fd2,
                    pg_size: GB,
                    memfd_flags: flags_lv2,
                    sizes: TierSizes::default(),
                    pages_delta: 0,
                    pages_added: 0,
                },
            ],
            lv_max,
            lock_file,
            backend,
        })
    }

    fn lock(&self) -> Result<()> {
        // SAFETY: locking the first bytes of our own lock file.
        let rc = unsafe {
            libc::lseek(self.lock_file.as_raw_fd(), 0, libc::SEEK_SET);
            libc::lockf(self.lock_file.as_raw_fd(), libc::F_LOCK, LOCK_OFFSET_END)
        };
        if rc < 0 {
            let e = std::io::Error::last_os_error();
            error!("lock acrn hugetlb failed with: {e}");
            return Err(HugetlbError::Lock(e));
        }
        Ok(())
    }

    fn unlock(&self) {
        // SAFETY: unlocking the range locked above.
        let rc = unsafe { libc::lockf(self.lock_file.as_raw_fd(), libc::F_ULOCK, LOCK_OFFSET_END) };
        if rc < 0 {
            error!(
                "unlock acrn hugetlb failed with: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    /// delta = needed - free per tier; true if any tier has a gap.
    fn check_memgap(&mut self) -> bool {
        let mut has_gap = false;
        for level in 0..self.lv_max {
            let tier = &mut self.tiers[level];
            if tier.fd < 0 {
                tier.pages_delta = 0;
                continue;
            }
            let free_pages = self.backend.free_pages(level);
            let need_pages = (tier.sizes.total() / tier.pg_size) as i64;
            tier.pages_delta = need_pages - free_pages;
            if tier.pages_delta > 0 {
                has_gap = true;
            }
            info!(
                "level {} free/need pages:{}/{} page size:0x{:x}",
                level, free_pages, need_pages, tier.pg_size
            );
        }
        has_gap
    }

    fn reserve_more_pages(&mut self, level: usize) {
        let orig_pages = self.backend.nr_pages(level);
        let total_pages = orig_pages + self.tiers[level].pages_delta;
        self.backend.set_nr_pages(level, total_pages);
        let cur_pages = self.backend.nr_pages(level);
        self.tiers[level].pages_added += cur_pages - orig_pages;
        self.tiers[level].pages_delta = total_pages - cur_pages;
    }

    /// Give back one unused page from a larger tier so the smaller tier can
    /// grow. Returns false when no tier above `level_limit` had a spare.
    fn release_larger_freepage(&mut self, level_limit: usize) -> bool {
        let mut level = self.lv_max as i64 - 1;
        while level >= level_limit as i64 {
            let l = level as usize;
            if self.tiers[l].pages_delta >= 0 {
                level -= 1;
                continue;
            }
            let orig_pages = self.backend.nr_pages(l);
            self.backend.set_nr_pages(l, orig_pages - 1);
            let cur_pages = self.backend.nr_pages(l);
            if cur_pages < orig_pages {
                self.tiers[l].pages_added -= orig_pages - cur_pages;
                self.tiers[l].pages_delta += 1;
                break;
            }
            level -= 1;
        }
        level >= level_limit as i64
    }

    /// Raise `nr_hugepages` to cover every tier's gap. A partial grow of
    /// the 1 GiB tier folds into the 2 MiB tier; if the 2 MiB tier still
    /// cannot satisfy its gap, free 1 GiB pages are released one at a time
    /// and the 2 MiB tier retries.
    fn reserve_pages(&mut self) -> bool {
        info!("to reserve more free pages:");
        let mut level = self.lv_max as i64 - 1;
        while level >= HUGETLB_LV1 as i64 {
            let l = level as usize;
            if self.tiers[l].pages_delta <= 0 {
                level -= 1;
                continue;
            }

            self.reserve_more_pages(l);

            if self.tiers[l].pages_delta <= 0 {
                level -= 1;
                continue;
            }

            /* The system can allocate fewer pages than asked, especially
             * 1 GiB ones, even with enough free memory; the next level
             * down absorbs the shortfall. */
            if l > HUGETLB_LV1 {
                let left_gap = self.tiers[l].pages_delta;
                let ratio = (self.tiers[l].pg_size / self.tiers[l - 1].pg_size) as i64;
                self.tiers[l - 1].pages_delta += left_gap * ratio;
                level -= 1;
                continue;
            }

            if self.release_larger_freepage(l + 1) {
                continue;
            } else {
                break;
            }
        }

        if level >= HUGETLB_LV1 as i64 {
            error!(
                "level {} pages gap: {} failed to reserve!",
                level, self.tiers[level as usize].pages_delta
            );
            return false;
        }

        info!("now enough free pages are reserved!");
        true
    }

    /// Undo any `nr_hugepages` growth performed by a failed setup.
    fn rollback_reserved(&mut self) {
        for level in 0..self.lv_max {
            if self.tiers[level].pages_added != 0 {
                let cur = self.backend.nr_pages(level);
                self.backend
                    .set_nr_pages(level, cur - self.tiers[level].pages_added);
                self.tiers[level].pages_added = 0;
            }
        }
    }

    fn close_memfds(&mut self) {
        for tier in self.tiers.iter_mut() {
            if tier.fd >= 0 {
                // SAFETY: closing our own memfd.
                unsafe { libc::close(tier.fd) };
                tier.fd = -1;
            }
        }
    }

    /// Map one run of a segment from a tier's memfd and pre-fault it.
    fn mmap_from_level(
        &mut self,
        baseaddr: *mut u8,
        level: usize,
        len: u64,
        offset: u64,
        skip: u64,
        regions: &mut Vec<MmapMemRegion>,
    ) -> Result<()> {
        if regions.len() >= MAX_MMAP_REGIONS {
            error!("exceed supported regions.");
            return Err(HugetlbError::TooManyRegions);
        }

        let fd = self.tiers[level].fd;
        // SAFETY: the target range lies inside the PROT_NONE guard VMA the
        // caller reserved; MAP_FIXED replaces it with the hugetlb mapping.
        let addr = unsafe {
            libc::mmap(
                baseaddr.add(offset as usize).cast(),
                len as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                skip as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(HugetlbError::Mmap(std::io::Error::last_os_error()));
        }
        let addr = addr as *mut u8;

        regions.push(MmapMemRegion {
            gpa_start: offset,
            gpa_end: offset + len,
            fd,
            fd_offset: skip,
            hva: addr,
        });
        info!("mmap 0x{len:x}@{addr:p}");

        /* Touching each page triggers hugetlb_fault() so the pages are
         * allocated and cleared up front. */
        let pagesz = self.tiers[level].pg_size;
        info!("touch {} pages with pagesz 0x{:x}", len / pagesz, pagesz);
        let mut p = addr;
        for _ in 0..(len / pagesz) {
            // SAFETY: p walks the mapping established above.
            unsafe {
                let v = std::ptr::read_volatile(p);
                std::ptr::write_volatile(p, v);
                p = p.add(pagesz as usize);
            }
        }

        Ok(())
    }

    /// Map one guest segment, trying the largest tier first and reassigning
    /// whole large pages to the smaller tier when MAP_FIXED fails.
    fn mmap_segment(
        &mut self,
        baseaddr: *mut u8,
        mut offset: u64,
        seg: fn(&TierSizes) -> u64,
        seg_mut: fn(&mut TierSizes) -> &mut u64,
        skip_of: fn(&TierSizes) -> u64,
        regions: &mut Vec<MmapMemRegion>,
    ) -> Result<()> {
        for level in (0..self.lv_max).rev() {
            let mut len = seg(&self.tiers[level].sizes);
            let skip = skip_of(&self.tiers[level].sizes);
            let pg_size = self.tiers[level].pg_size;

            while len > 0 {
                match self.mmap_from_level(baseaddr, level, len, offset, skip, regions) {
                    Ok(()) => {
                        offset += len;
                        break;
                    }
                    Err(HugetlbError::TooManyRegions) => {
                        return Err(HugetlbError::TooManyRegions)
                    }
                    Err(_) if level > HUGETLB_LV1 => {
                        /* hand one large page over to the smaller tier */
                        *seg_mut(&mut self.tiers[level].sizes) -= pg_size;
                        *seg_mut(&mut self.tiers[level - 1].sizes) += pg_size;
                        len = seg(&self.tiers[level].sizes);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Back a VM's four segments with huge pages and return the finished
    /// memory map. On any failure the lock is dropped, the mappings and
    /// memfds are released, and raised page counts are restored.
    pub fn setup_memory(
        &mut self,
        lowmem: u64,
        biosmem: u64,
        fbmem: u64,
        highmem: u64,
        highmem_gpa_base: u64,
    ) -> Result<GuestMem> {
        if lowmem == 0 {
            error!("vm requests 0 memory");
            return Err(HugetlbError::ZeroMemory);
        }

        /* The memfds are closed in the course of a reboot sequence;
         * recreate any that are gone. */
        for level in 0..self.lv_max {
            if self.tiers[level].fd < 0 {
                self.tiers[level].fd =
                    create_memfd(self.tiers[level].memfd_flags).map_err(HugetlbError::Memfd)?;
            }
        }

        let lv1_pg = self.tiers[HUGETLB_LV1].pg_size;
        for sz in [lowmem, biosmem, fbmem, highmem] {
            if sz & (lv1_pg - 1) != 0 {
                error!("Memory size is not aligned to 2M.");
                return Err(HugetlbError::Unaligned);
            }
        }

        let mut total_size = highmem_gpa_base + highmem;

        let pg_sizes = [self.tiers[0].pg_size, self.tiers[1].pg_size];
        let enabled = [self.tiers[0].fd >= 0, self.tiers[1].fd >= 0];
        let split = split_tiers(lowmem, fbmem, biosmem, highmem, &pg_sizes, &enabled, self.lv_max);
        for level in 0..HUGETLB_LV_MAX {
            self.tiers[level].sizes = split[level];
            self.tiers[level].pages_added = 0;
        }

        self.lock()?;

        let result = (|| -> Result<GuestMem> {
            if self.check_memgap() && !self.reserve_pages() {
                return Err(HugetlbError::ReserveFailed);
            }

            /* room to align the base address up to the largest page size */
            for level in (0..self.lv_max).rev() {
                let sizes = self.tiers[level].sizes;
                if self.tiers[level].enabled_with(&sizes) {
                    total_size += self.tiers[level].pg_size;
                    break;
                }
            }

            info!("try to setup hugepage with:");
            for level in 0..self.lv_max {
                let s = &self.tiers[level].sizes;
                info!(
                    "\tlevel {} - lowmem 0x{:x}, fbmem 0x{:x}, biosmem 0x{:x}, highmem 0x{:x}",
                    level, s.lowmem, s.fbmem, s.biosmem, s.highmem
                );
            }
            info!("total_size 0x{total_size:x}");

            // SAFETY: reserving an anonymous PROT_NONE guard VMA.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    total_size as usize,
                    libc::PROT_NONE,
                    libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                error!("anony mmap fail");
                return Err(HugetlbError::Mmap(std::io::Error::last_os_error()));
            }
            let guard = GuardVma {
                ptr: ptr as *mut u8,
                size: total_size,
            };

            let mut baseaddr = guard.ptr;
            for level in (0..self.lv_max).rev() {
                let sizes = self.tiers[level].sizes;
                if self.tiers[level].enabled_with(&sizes) {
                    baseaddr =
                        align_up(guard.ptr as u64, self.tiers[level].pg_size) as *mut u8;
                    break;
                }
            }
            info!("mmap ptr {:p} -> baseaddr {:p}", guard.ptr, baseaddr);

            let mut regions = Vec::new();

            self.mmap_segment(
                baseaddr,
                0,
                |s| s.lowmem,
                |s| &mut s.lowmem,
                |_| 0,
                &mut regions,
            )
            .inspect_err(|_| error!("lowmem mmap failed"))?;

            self.mmap_segment(
                baseaddr,
                highmem_gpa_base,
                |s| s.highmem,
                |s| &mut s.highmem,
                |s| s.lowmem,
                &mut regions,
            )
            .inspect_err(|_| error!("highmem mmap failed"))?;

            self.mmap_segment(
                baseaddr,
                4 * GB - biosmem,
                |s| s.biosmem,
                |s| &mut s.biosmem,
                |s| s.lowmem + s.highmem,
                &mut regions,
            )
            .inspect_err(|_| error!("biosmem mmap failed"))?;

            self.mmap_segment(
                baseaddr,
                4 * GB - biosmem - fbmem,
                |s| s.fbmem,
                |s| &mut s.fbmem,
                |s| s.lowmem + s.highmem + s.biosmem,
                &mut regions,
            )
            .inspect_err(|_| error!("fbmem mmap failed"))?;

            /* Fix the memfds at their consumed sizes and seal them. */
            for level in 0..self.lv_max {
                let tier = &self.tiers[level];
                if tier.fd < 0 {
                    continue;
                }
                let mem_size = tier.sizes.total();
                // SAFETY: sizing and sealing our own memfd.
                unsafe {
                    if libc::ftruncate(tier.fd, mem_size as libc::off_t) == -1 {
                        error!("Fail to set mem_size for level {level}.");
                        return Err(HugetlbError::Seal(std::io::Error::last_os_error()));
                    }
                    if libc::fcntl(
                        tier.fd,
                        libc::F_ADD_SEALS,
                        libc::F_SEAL_GROW | libc::F_SEAL_SHRINK | libc::F_SEAL_SEAL,
                    ) == -1
                    {
                        error!("Fail to set seal flag for level {level}.");
                        return Err(HugetlbError::Seal(std::io::Error::last_os_error()));
                    }
                }
            }

            info!("really setup hugepage with:");
            for level in 0..self.lv_max {
                let s = &self.tiers[level].sizes;
                info!(
                    "\tlevel {} - lowmem 0x{:x}, biosmem 0x{:x}, highmem 0x{:x}",
                    level, s.lowmem, s.biosmem, s.highmem
                );
            }

            Ok(GuestMem {
                guard,
                baseaddr,
                regions,
                tier_usage: [self.tiers[0].sizes, self.tiers[1].sizes],
                tier_fds: [self.tiers[0].fd, self.tiers[1].fd],
            })
        })();

        match result {
            Ok(mem) => {
                self.unlock();
                Ok(mem)
            }
            Err(e) => {
                self.rollback_reserved();
                self.unlock();
                self.close_memfds();
                Err(e)
            }
        }
    }

    /// Close the memfds once the VM's memory has been dropped.
    pub fn unsetup_memory(&mut self) {
        self.close_memfds();
    }
}

impl Drop for HugetlbAllocator {
    fn drop(&mut self) {
        self.close_memfds();
    }
}

struct GuardVma {
    ptr: *mut u8,
    size: u64,
}

impl Drop for GuardVma {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: unmapping the VMA reserved in setup_memory.
            unsafe { libc::munmap(self.ptr.cast(), self.size as usize) };
        }
    }
}

// SAFETY: the VMA is owned exclusively by the holder.
unsafe impl Send for GuardVma {}

/// The finished guest memory map: guard VMA, aligned base, and the recorded
/// MAP_FIXED regions.
pub struct GuestMem {
    guard: GuardVma,
    baseaddr: *mut u8,
    regions: Vec<MmapMemRegion>,
    tier_usage: [TierSizes; HUGETLB_LV_MAX],
    tier_fds: [RawFd; HUGETLB_LV_MAX],
}

// SAFETY: the mapping is owned by this struct for its whole lifetime;
// aliasing into guest RAM is inherent to a device model and confined to the
// accessors below.
unsafe impl Send for GuestMem {}

impl GuestMem {
    pub fn base_addr(&self) -> u64 {
        self.baseaddr as u64
    }

    pub fn hva(&self, gpa: u64) -> *mut u8 {
        // SAFETY: callers (vm_map_gpa) range-check gpa first.
        unsafe { self.baseaddr.add(gpa as usize) }
    }

    pub fn zero_range(&mut self, gpa: u64, len: u64) {
        if len == 0 {
            return;
        }
        // SAFETY: the range was mapped by setup_memory and stays mapped
        // until this struct drops.
        unsafe { std::ptr::write_bytes(self.baseaddr.add(gpa as usize), 0, len as usize) };
    }

    pub fn find_region(&self, gpa: u64) -> Option<MemRegion> {
        let r = self
            .regions
            .iter()
            .find(|r| gpa >= r.gpa_start && gpa < r.gpa_end)?;
        Some(MemRegion {
            fd: r.fd,
            fd_offset: gpa - r.gpa_start + r.fd_offset,
        })
    }

    /// DMA-buf export needs one fd spanning a memory class; refuse when a
    /// class is split across both tiers.
    pub fn allow_dmabuf(&self, lowmem: u64, highmem: u64) -> bool {
        if highmem > 0 {
            let lv1 = self.tier_fds[HUGETLB_LV1] >= 0 && self.tier_usage[HUGETLB_LV1].highmem > 0;
            let lv2 = self.tier_fds[HUGETLB_LV2] >= 0 && self.tier_usage[HUGETLB_LV2].highmem > 0;
            if lv1 && lv2 {
                return false;
            }
        }
        if lowmem > 0 {
            let lv1 = self.tier_fds[HUGETLB_LV1] >= 0 && self.tier_usage[HUGETLB_LV1].lowmem > 0;
            let lv2 = self.tier_fds[HUGETLB_LV2] >= 0 && self.tier_usage[HUGETLB_LV2].lowmem > 0;
            if lv1 && lv2 {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn split_prefers_big_pages() {
        // 2 GiB lowmem, 16 MiB bios, 16 MiB fb, no high: the 1 GiB tier
        // takes the whole of lowmem, the 2 MiB tier serves bios+fb.
        let pg = [2 * MB, GB];
        let enabled = [true, true];
        let split = split_tiers(2 * GB, 16 * MB, 16 * MB, 0, &pg, &enabled, 2);
        assert_eq!(split[HUGETLB_LV2].lowmem, 2 * GB);
        assert_eq!(split[HUGETLB_LV2].biosmem, 0);
        assert_eq!(split[HUGETLB_LV2].fbmem, 0);
        assert_eq!(split[HUGETLB_LV1].lowmem, 0);
        assert_eq!(split[HUGETLB_LV1].biosmem, 16 * MB);
        assert_eq!(split[HUGETLB_LV1].fbmem, 16 * MB);
        assert_eq!(split[HUGETLB_LV1].total(), 32 * MB);
    }

    #[test]
    fn split_remainder_falls_to_small_tier() {
        let pg = [2 * MB, GB];
        let enabled = [true, true];
        let split = split_tiers(GB + 512 * MB, 0, 0, 3 * GB + 2 * MB, &pg, &enabled, 2);
        assert_eq!(split[HUGETLB_LV2].lowmem, GB);
        assert_eq!(split[HUGETLB_LV1].lowmem, 512 * MB);
        assert_eq!(split[HUGETLB_LV2].highmem, 3 * GB);
        assert_eq!(split[HUGETLB_LV1].highmem, 2 * MB);
    }

    #[test]
    fn split_without_level2() {
        let pg = [2 * MB, GB];
        let enabled = [true, false];
        let split = split_tiers(2 * GB, 0, 0, 0, &pg, &enabled, 1);
        assert_eq!(split[HUGETLB_LV2].total(), 0);
        assert_eq!(split[HUGETLB_LV1].lowmem, 2 * GB);
    }

    /// A fake backend with a shared memory budget (in 2 MiB units), so
    /// releasing a 1 GiB page genuinely frees room for 512 small ones.
    #[derive(Clone)]
    struct FakePages {
        inner: Arc<Mutex<FakeInner>>,
    }

    struct FakeInner {
        nr: [i64; 2],
        used: [i64; 2],
        budget: i64,
        // extra per-level ceiling, e.g. "only one gigantic page exists"
        max: [i64; 2],
    }

    const LV2_UNITS: i64 = 512;

    impl FakePages {
        fn new(nr: [i64; 2], budget: i64, max: [i64; 2]) -> FakePages {
            FakePages {
                inner: Arc::new(Mutex::new(FakeInner {
                    nr,
                    used: [0, 0],
                    budget,
                    max,
                })),
            }
        }
        fn nr(&self, level: usize) -> i64 {
            self.inner.lock().unwrap().nr[level]
        }
    }

    impl HugePagesBackend for FakePages {
        fn nr_pages(&self, level: usize) -> i64 {
            self.inner.lock().unwrap().nr[level]
        }
        fn free_pages(&self, level: usize) -> i64 {
            let i = self.inner.lock().unwrap();
            i.nr[level] - i.used[level]
        }
        fn set_nr_pages(&mut self, level: usize, pages: i64) {
            let mut i = self.inner.lock().unwrap();
            let units = if level == HUGETLB_LV2 { LV2_UNITS } else { 1 };
            let other = 1 - level;
            let other_units = if other == HUGETLB_LV2 { LV2_UNITS } else { 1 };
            let room = (i.budget - i.nr[other] * other_units) / units;
            i.nr[level] = pages.max(i.used[level]).min(room).min(i.max[level]);
        }
    }

    fn allocator_with(backend: FakePages) -> (HugetlbAllocator, tempfile::NamedTempFile) {
        let lock = tempfile::NamedTempFile::new().unwrap();
        // Plain memfds: these tests drive the reservation planning only.
        let flags = libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING;
        let alloc = HugetlbAllocator::with_backend_flags(
            Box::new(backend),
            lock.path().to_str().unwrap(),
            flags,
            flags,
        )
        .unwrap();
        (alloc, lock)
    }

    #[test]
    fn reserve_folds_lv2_shortfall_into_lv1() {
        // want 3 GiB of 1 GiB pages but only one can materialize; the two
        // missing pages must become 1024 small ones
        let fake = FakePages::new([0, 0], 100 * LV2_UNITS, [i64::MAX, 1]);
        let (mut alloc, _lock) = allocator_with(fake.clone());
        alloc.tiers[HUGETLB_LV2].sizes.lowmem = 3 * GB;
        alloc.tiers[HUGETLB_LV1].sizes = TierSizes::default();
        assert!(alloc.check_memgap());
        assert!(alloc.reserve_pages());
        assert_eq!(fake.nr(HUGETLB_LV2), 1);
        assert_eq!(fake.nr(HUGETLB_LV1), 1024);
    }

    #[test]
    fn lv2_free_page_released_for_lv1() {
        // Level-2 holds exactly one free page nobody needs; level-1 wants
        // one page more than the remaining budget until it is released.
        let fake = FakePages::new([0, 1], 1024, [i64::MAX, 1]);
        let (mut alloc, _lock) = allocator_with(fake.clone());
        alloc.tiers[HUGETLB_LV1].sizes.lowmem = 513 * 2 * MB;
        alloc.tiers[HUGETLB_LV2].sizes = TierSizes::default();
        assert!(alloc.check_memgap());
        assert!(alloc.reserve_pages());
        assert_eq!(fake.nr(HUGETLB_LV2), 0);
        assert_eq!(fake.nr(HUGETLB_LV1), 513);
    }

    #[test]
    fn reserve_fails_when_budget_is_gone() {
        let fake = FakePages::new([0, 0], 100, [i64::MAX, i64::MAX]);
        let (mut alloc, _lock) = allocator_with(fake.clone());
        alloc.tiers[HUGETLB_LV1].sizes.lowmem = 200 * 2 * MB;
        alloc.tiers[HUGETLB_LV2].sizes = TierSizes::default();
        assert!(alloc.check_memgap());
        assert!(!alloc.reserve_pages());
    }

    #[test]
    fn rollback_restores_nr_pages() {
        let fake = FakePages::new([100, 0], 1 << 30, [i64::MAX, i64::MAX]);
        let (mut alloc, _lock) = allocator_with(fake.clone());
        alloc.tiers[HUGETLB_LV1].sizes.lowmem = 200 * 2 * MB;
        assert!(alloc.check_memgap());
        assert!(alloc.reserve_pages());
        assert_eq!(fake.nr(HUGETLB_LV1), 200);
        alloc.rollback_reserved();
        assert_eq!(fake.nr(HUGETLB_LV1), 100);
    }
}
