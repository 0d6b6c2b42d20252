//! Device-model main: one process per guest VM. Owns guest RAM, services
//! the I/O request ring, runs the event loop and the platform peripherals,
//! loads the kernel and answers the supervisor over the management socket.

mod monitor;
mod pm_vuart;
mod vm_loop;

use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};

use dmevent::iothread::{iothread_parse_options, IothreadPool};
use dmevent::Mevent;
use dmhw::hpet::Vhpet;
use dmhw::pit::Vpit;
use dmhw::tpm_crb::TpmCrb;
use dmhw::tpm_emulator::SwtpmClient;
use dmhw::VmIrqOps;
use dmioc::ioc::{ioc_parse, IocDev};
use dmvmm::hugetlb::HugetlbAllocator;
use dmvmm::inout::PioBus;
use dmvmm::lapic;
use dmvmm::mem::MemBus;
use dmvmm::pm::{vm_get_suspend_mode, VmSuspendMode};
use dmvmm::sw_load::{self, SwLoadConfig};
use dmvmm::vm_event::{MonitorSink, VmEventCtx};
use dmvmm::vmmapi::{vm_parse_memsize, VmCreateOpts, VmCtx};

use monitor::{Monitor, MonitorVmOps};
use pm_vuart::{parse_pm_by_vuart, PmVuart};
use vm_loop::{vm_loop, IoreqRing};

#[derive(Parser)]
#[command(name = "acrn-dm", about = "userspace device model for guest VMs")]
struct Args {
    /// guest memory size, e.g. 2048m or 4g
    #[arg(short = 'm', long = "memsize")]
    memsize: String,

    /// bzImage kernel to direct-boot
    #[arg(short = 'k', long)]
    kernel: Option<String>,

    /// initial ramdisk image
    #[arg(short = 'r', long)]
    ramdisk: Option<String>,

    /// kernel command line
    #[arg(short = 'B', long)]
    bootargs: Option<String>,

    /// LAPIC ids this VM may run on, e.g. 1,2,3
    #[arg(long)]
    cpu_affinity: Option<String>,

    /// VM UUID as 32 hex digits
    #[arg(long)]
    uuid: Option<String>,

    /// software TPM control socket path
    #[arg(long)]
    vtpm2: Option<String>,

    /// IOC mediator: <uart path>[,<boot reason>]
    #[arg(long)]
    ioc: Option<String>,

    /// power-management vuart: pty,<path> or tty,<path>
    #[arg(long)]
    pm_vuart: Option<String>,

    /// allow the pm-vuart to trigger S5 through the lifecycle manager
    #[arg(long)]
    pm_notify_channel: bool,

    /// iothread pool: N[@cpuset[/cpuset...]]
    #[arg(long)]
    iothread: Option<String>,

    /// the guest is a real-time VM
    #[arg(long)]
    rtvm: bool,

    /// LAPIC passthrough (implies RT and completion polling)
    #[arg(long)]
    lapic_pt: bool,

    /// enable the secure world
    #[arg(long)]
    trusty: bool,

    /// drain hypervisor/DM event rings to the monitor
    #[arg(long)]
    vmevent: bool,

    /// pass software SRAM (RTCT) through to the guest
    #[arg(long)]
    ssram: bool,

    /// VM name
    name: String,
}

fn parse_uuid(arg: Option<&str>) -> Result<[u8; 16], String> {
    let Some(arg) = arg else {
        return Ok([0u8; 16]);
    };
    let hex: String = arg.chars().filter(|c| *c != '-').collect();
    if hex.len() != 32 {
        return Err(format!("bad uuid {arg}"));
    }
    let mut uuid = [0u8; 16];
    for (i, byte) in uuid.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| format!("bad uuid {arg}"))?;
    }
    Ok(uuid)
}

struct SuspendOps;

impl MonitorVmOps for SuspendOps {
    fn suspend(&self) -> i32 {
        dmvmm::pm::vm_set_suspend_mode(VmSuspendMode::Suspend);
        0
    }

    fn resume(&self, _wakeup_reason: u32) -> i32 {
        dmvmm::pm::vm_resume();
        0
    }
}

struct IocVmOps(Arc<IocDev>);

impl MonitorVmOps for IocVmOps {
    fn stop(&self, _force: bool) -> i32 {
        self.0.vm_stop_request();
        0
    }

    fn suspend(&self) -> i32 {
        self.0.vm_suspend_request();
        0
    }

    fn resume(&self, wakeup_reason: u32) -> i32 {
        let reason = if wakeup_reason != 0 {
            wakeup_reason
        } else {
            monitor::get_wakeup_reason()
        };
        match self.0.vm_resume_request(reason) {
            Ok(()) => 0,
            Err(()) => -1,
        }
    }
}

struct PauseOps(Arc<VmCtx>);

impl MonitorVmOps for PauseOps {
    fn pause(&self) -> i32 {
        self.0.pause();
        0
    }

    fn unpause(&self) -> i32 {
        /* the hypervisor resumes a paused VM on the next start request */
        match self.0.run() {
            Ok(()) => 0,
            Err(_) => -1,
        }
    }
}

fn run_vm(args: &Args, allocator: &mut HugetlbAllocator, memsize: u64) -> Result<bool, String> {
    let mevent = Mevent::new().map_err(|e| format!("mevent init: {e}"))?;
    let ring = Arc::new(IoreqRing::new());

    let cpu_affinity = match args.cpu_affinity.as_deref() {
        Some(opt) => {
            let map = lapic::load_platform_lapic_ids()
                .map_err(|e| format!("MADT: {e}"))?;
            lapic::parse_cpu_affinity(opt, &map).map_err(|e| format!("cpu affinity: {e}"))?
        }
        None => 0,
    };

    let opts = VmCreateOpts {
        uuid: parse_uuid(args.uuid.as_deref())?,
        trusty_enabled: args.trusty,
        lapic_pt: args.lapic_pt,
        is_rtvm: args.rtvm,
        cpu_affinity,
    };

    let mut ctx =
        VmCtx::create(&args.name, ring.base_address(), &opts).map_err(|e| format!("{e}"))?;
    info!(
        "vm_create: {} (vmid {}, {} vcpus)",
        args.name,
        ctx.vmid(),
        ctx.vcpu_num()
    );

    ctx.setup_memory(memsize, allocator)
        .map_err(|e| format!("setup memory: {e}"))?;
    let ctx = Arc::new(ctx);

    let pio = Arc::new(PioBus::new());
    let mmio = Arc::new(MemBus::new());
    let irq: Arc<dyn dmhw::IrqOps> = Arc::new(VmIrqOps(ctx.clone()));

    /* platform peripherals */
    let vpit = Vpit::new(&mevent, irq.clone()).map_err(|e| format!("vpit: {e}"))?;
    vpit.register(&pio).map_err(|e| format!("vpit: {e}"))?;

    let vhpet = Vhpet::new(&mevent, irq.clone()).map_err(|e| format!("vhpet: {e}"))?;
    vhpet.register(&mmio).map_err(|e| format!("vhpet: {e}"))?;

    let tpm = match args.vtpm2.as_deref() {
        Some(sock_path) => {
            let swtpm = Arc::new(
                SwtpmClient::connect(sock_path).map_err(|e| format!("swtpm: {e}"))?,
            );
            let crb = Arc::new(TpmCrb::new(swtpm).map_err(|e| format!("tpm crb: {e}"))?);
            crb.register(&mmio).map_err(|e| format!("tpm crb: {e}"))?;
            Some(crb)
        }
        None => None,
    };

    let iothreads = IothreadPool::new();
    if let Some(opt) = args.iothread.as_deref() {
        let parsed = iothread_parse_options(Some(opt), &args.name)
            .map_err(|e| format!("iothread: {e}"))?;
        iothreads
            .create(&parsed)
            .map_err(|e| format!("iothread: {e}"))?;
    }

    let mut mon = Monitor::run(&args.name).map_err(|e| format!("monitor: {e}"))?;
    mon.register_vm_ops(Arc::new(SuspendOps), "pm");
    mon.register_vm_ops(Arc::new(PauseOps(ctx.clone())), "vm");

    let ioc = match args.ioc.as_deref() {
        Some(opt) => {
            let params = ioc_parse(opt).map_err(|e| format!("ioc: {e}"))?;
            let vmname = args.name.clone();
            match IocDev::init(
                &params,
                Box::new(move |due| {
                    monitor::set_wakeup_timer(&vmname, due);
                }),
            ) {
                Ok(dev) => {
                    let dev = Arc::new(dev);
                    mon.register_vm_ops(Arc::new(IocVmOps(dev.clone())), "ioc_dm");
                    Some(dev)
                }
                Err(e) => {
                    warn!("ioc mediator startup failed: {e}");
                    None
                }
            }
        }
        None => None,
    };

    let pm_vuart = match args.pm_vuart.as_deref() {
        Some(opt) => {
            let params = parse_pm_by_vuart(opt).map_err(|e| format!("pm_vuart: {e}"))?;
            let dev = Arc::new(
                PmVuart::init(&params, args.pm_notify_channel)
                    .map_err(|e| format!("pm_vuart: {e}"))?,
            );
            mon.register_vm_ops(dev.clone(), "pm-vuart");
            Some(dev)
        }
        None => None,
    };

    if args.ssram {
        match dmvmm::rtct::load_platform_rtct() {
            Ok(mut table) => match dmvmm::rtct::remap_software_sram(&mut table) {
                Ok(regions) => {
                    for r in &regions {
                        if ctx.map_ptdev_mmio(r.gpa, r.size, r.hpa).is_err() {
                            warn!("ssram: EPT map of {:#x} failed", r.gpa);
                        }
                    }
                }
                Err(e) => warn!("ssram: {e}"),
            },
            Err(e) => warn!("ssram: {e}"),
        }
    }

    let vm_event = if args.vmevent {
        /* poweroff / triple fault reported through the event ring drive
         * the lifecycle state and wake the dispatch loop */
        let sink_mevent = mevent.clone();
        let sink: MonitorSink = Arc::new(move |msg: &str| {
            info!("vm_event: {msg}");
            let parsed: Option<u64> = serde_json::from_str::<serde_json::Value>(msg)
                .ok()
                .and_then(|v| v.get("vm_event").and_then(|t| t.as_u64()));
            match parsed {
                Some(t) if t == dmvmm::vm_event::VM_EVENT_POWEROFF as u64 => {
                    dmvmm::pm::vm_set_suspend_mode(VmSuspendMode::Poweroff);
                    let _ = sink_mevent.notify();
                }
                Some(t) if t == dmvmm::vm_event::VM_EVENT_TRIPLE_FAULT as u64 => {
                    dmvmm::pm::vm_set_suspend_mode(VmSuspendMode::TripleFault);
                    let _ = sink_mevent.notify();
                }
                _ => {}
            }
        });
        match VmEventCtx::init(&ctx, &mevent, sink) {
            Ok(ve) => Some(ve),
            Err(e) => {
                warn!("vm_event init failed: {e}");
                None
            }
        }
    } else {
        None
    };

    /* guest software */
    let mut sw_cfg = SwLoadConfig::default();
    if let Some(k) = args.kernel.as_deref() {
        sw_cfg.parse_kernel(k).map_err(|e| format!("{e}"))?;
    }
    if let Some(r) = args.ramdisk.as_deref() {
        sw_cfg.parse_ramdisk(r).map_err(|e| format!("{e}"))?;
    }
    if let Some(b) = args.bootargs.as_deref() {
        sw_cfg.parse_bootargs(b).map_err(|e| format!("{e}"))?;
    }
    if sw_cfg.kernel_path.is_some() {
        let bsp_regs = sw_load::sw_load_bzimage(&ctx, &sw_cfg).map_err(|e| format!("{e}"))?;
        ctx.set_vcpu_regs(&bsp_regs).map_err(|e| format!("{e}"))?;
    }

    ctx.create_ioreq_client().map_err(|e| format!("{e}"))?;
    ctx.run().map_err(|e| format!("{e}"))?;
    dmvmm::pm::vm_set_suspend_mode(VmSuspendMode::None);

    /* devices with guest-visible state reset on SYSTEM_RESET */
    let reset_tpm = tpm.clone();
    let reset_devices = Box::new(move || {
        if let Some(tpm) = reset_tpm.as_ref() {
            tpm.reset_for_reboot();
        }
    });

    let loop_ctx = ctx.clone();
    let loop_ring = ring.clone();
    let loop_pio = pio.clone();
    let loop_mmio = mmio.clone();
    let vm_loop_thread = std::thread::Builder::new()
        .name("vm_loop".into())
        .spawn(move || vm_loop(loop_ctx, loop_ring, loop_pio, loop_mmio, reset_devices))
        .map_err(|e| format!("spawn vm_loop: {e}"))?;

    /* head off to the main event dispatch loop */
    mevent.dispatch(|| vm_get_suspend_mode().is_terminal());

    let mode = vm_get_suspend_mode();
    info!("event loop exited in mode {}", mode.as_str());

    /* teardown in reverse init order */
    ctx.pause();
    let _ = ctx.destroy_ioreq_client();
    let _ = vm_loop_thread.join();

    drop(vm_event);
    if let Some(pm_vuart) = pm_vuart {
        pm_vuart.deinit();
    }
    if let Some(ioc) = ioc {
        ioc.deinit();
    }
    mon.close();
    iothreads.deinit();
    if let Some(tpm) = tpm {
        tpm.deinit(&mmio);
    }
    vhpet.deinit(&mmio);
    vpit.deinit(&pio);

    ctx.unsetup_memory();
    allocator.unsetup_memory();
    ctx.destroy();
    mevent.deinit();

    Ok(mode == VmSuspendMode::FullReset)
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let memsize = match vm_parse_memsize(&args.memsize) {
        Ok(m) => m,
        Err(e) => {
            error!("invalid memsize {}: {e}", args.memsize);
            std::process::exit(1);
        }
    };

    let mut allocator = match HugetlbAllocator::new() {
        Ok(a) => a,
        Err(e) => {
            error!("unable to initialize hugetlb: {e}");
            std::process::exit(1);
        }
    };

    /* a FULL_RESET tears the VM down completely and builds it again */
    loop {
        match run_vm(&args, &mut allocator, memsize) {
            Ok(true) => {
                info!("restarting {} after full reset", args.name);
                continue;
            }
            Ok(false) => break,
            Err(e) => {
                error!("{e}");
                std::process::exit(1);
            }
        }
    }
}
