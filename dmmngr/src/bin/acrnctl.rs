//! Command-line control of guest VMs through the management sockets.

use std::path::Path;

use clap::{Parser, Subcommand};
use dmmngr::vm_ops::{self, VmState};
use dmmngr::ACRN_CONF_PATH_ADD;

#[derive(Parser)]
#[command(name = "acrnctl", about = "manage guest VMs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List all the VMs and their state
    List,
    /// Start a stopped VM
    Start { name: String },
    /// Stop one or more VMs
    Stop { names: Vec<String> },
    /// Register a launch script as a VM
    Add {
        script: String,
        args: Vec<String>,
    },
    /// Remove one or more registered VMs
    Del { names: Vec<String> },
    /// Freeze one or more VMs
    Pause { names: Vec<String> },
    /// Unfreeze one or more VMs
    Continue { names: Vec<String> },
    /// Suspend one or more running VMs
    Suspend { names: Vec<String> },
    /// Resume one or more suspended VMs
    Resume { names: Vec<String> },
    /// Stop and restart one or more VMs
    Reset { names: Vec<String> },
    /// Rescan a virtio-blk device of a running VM
    Blkrescan { name: String, devargs: String },
}

fn require_vm(name: &str) -> Result<VmState, i32> {
    let list = vm_ops::vmmngr_update();
    match vm_ops::find_vm(&list, name) {
        Some(vm) => Ok(vm.state),
        None => {
            eprintln!("Can't find vm {name}");
            Err(1)
        }
    }
}

fn cmd_list() -> i32 {
    let list = vm_ops::vmmngr_update();
    if list.is_empty() {
        println!("There are no VMs");
        return 0;
    }
    for vm in list {
        println!("{}\t\t{}", vm.name, vm.state.as_str());
    }
    0
}

fn cmd_start(name: &str) -> i32 {
    match require_vm(name) {
        Ok(VmState::Created) => {}
        Ok(state) => {
            eprintln!("{name} is {}, only a stopped VM can be started", state.as_str());
            return 1;
        }
        Err(rc) => return rc,
    }
    match vm_ops::start_vm(name) {
        Ok(status) if status.success() => 0,
        _ => {
            eprintln!("failed to start {name}");
            1
        }
    }
}

fn for_each(names: &[String], f: impl Fn(&str) -> i32) -> i32 {
    let mut rc = 0;
    for name in names {
        if require_vm(name).is_err() {
            rc = 1;
            continue;
        }
        if f(name) != 0 {
            rc = 1;
        }
    }
    rc
}

fn cmd_add(script: &str, args: &[String]) -> i32 {
    let src = Path::new(script);
    let Some(stem) = src.file_stem().and_then(|s| s.to_str()) else {
        eprintln!("invalid script name {script}");
        return 1;
    };
    if std::fs::create_dir_all(ACRN_CONF_PATH_ADD).is_err() {
        eprintln!("can't create {ACRN_CONF_PATH_ADD}");
        return 1;
    }
    let dst = Path::new(ACRN_CONF_PATH_ADD).join(format!("{stem}.sh"));
    if std::fs::copy(src, &dst).is_err() {
        eprintln!("can't copy {script} to {}", dst.display());
        return 1;
    }
    let args_path = Path::new(ACRN_CONF_PATH_ADD).join(format!("{stem}.args"));
    if std::fs::write(&args_path, args.join(" ")).is_err() {
        eprintln!("can't store args in {}", args_path.display());
        return 1;
    }
    println!("{stem} added");
    0
}

fn cmd_del(names: &[String]) -> i32 {
    let mut rc = 0;
    for name in names {
        let sh = Path::new(ACRN_CONF_PATH_ADD).join(format!("{name}.sh"));
        let args = Path::new(ACRN_CONF_PATH_ADD).join(format!("{name}.args"));
        if std::fs::remove_file(&sh).is_err() {
            eprintln!("Can't find vm {name}");
            rc = 1;
        }
        let _ = std::fs::remove_file(&args);
    }
    rc
}

fn cmd_reset(names: &[String]) -> i32 {
    let mut rc = 0;
    for name in names {
        if vm_ops::stop_vm(name) != 0 {
            rc = 1;
            continue;
        }
        if cmd_start(name) != 0 {
            rc = 1;
        }
    }
    rc
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let rc = match cli.command {
        Command::List => cmd_list(),
        Command::Start { name } => cmd_start(&name),
        Command::Stop { names } => for_each(&names, |n| vm_ops::stop_vm(n)),
        Command::Add { script, args } => cmd_add(&script, &args),
        Command::Del { names } => cmd_del(&names),
        Command::Pause { names } => for_each(&names, |n| vm_ops::pause_vm(n)),
        Command::Continue { names } => for_each(&names, |n| vm_ops::continue_vm(n)),
        Command::Suspend { names } => for_each(&names, |n| vm_ops::suspend_vm(n)),
        Command::Resume { names } => for_each(&names, |n| vm_ops::resume_vm(n)),
        Command::Reset { names } => cmd_reset(&names),
        Command::Blkrescan { name, devargs } => {
            if require_vm(&name).is_err() || vm_ops::blkrescan_vm(&name, &devargs) != 0 {
                1
            } else {
                0
            }
        }
    };
    std::process::exit(rc);
}
