use std::env::set_var;
use std::fs;
use std::process::Stdio;

use anyhow::{anyhow, Result};
use clap::{arg, command, ArgAction};
use execute::Execute;
use fork::{fork, Fork};
use fuser::MountOption;
use log::*;
use nix::sys::signal;
use retry::delay::Fixed;
use retry::{retry_with_index, OperationResult};

use razorfs::{Config, Engine, RazorFuse};

fn main() -> Result<()> {
    let matches = command!()
        .arg(arg!([mountpoint] "Mountpoint to mount the filesystem on").default_value("tests/mnt"))
        .arg(arg!(-f --front "Keep the daemon running in the foreground").action(ArgAction::SetTrue).required(false))
        .arg(arg!(--format "Wipe any existing storage directory before mounting").action(ArgAction::SetTrue).required(false))
        .arg(arg!(-r --read_only "Mount as a read-only filesystem").action(ArgAction::SetTrue).required(false))
        .arg(arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`").action(ArgAction::SetTrue).required(false))
        .arg(arg!(-d --storage_dir <DIR> "Storage directory (nodes.dat, strings.dat, wal.log, file_<inode>)").required(false))
        .get_matches();

    if matches.get_flag("verbose") {
        set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    let mountpoint = matches.get_one::<String>("mountpoint").unwrap();
    let path_mountpoint = fs::canonicalize(mountpoint)?;
    let abspath_mountpoint = path_mountpoint.to_str().unwrap().to_string();

    let mut config = Config::default();
    if let Some(dir) = matches.get_one::<String>("storage_dir") {
        config = config.with_storage_dir(dir);
    }
    if matches.get_flag("format") && config.storage_dir.exists() {
        info!("Wiping existing storage directory at {}", config.storage_dir.display());
        fs::remove_dir_all(&config.storage_dir)?;
    }
    info!("Storage directory: {}", config.storage_dir.display());
    if config.using_fallback {
        warn!("Using a scratch storage location; data will not survive a reboot");
    }

    macro_rules! umount {
        () => {{
            info!("Unmounting {}", abspath_mountpoint);
            let mut command = execute::command_args!("fusermount", "-u", abspath_mountpoint.clone());
            command.stdout(Stdio::piped());
            if let Ok(output) = command.execute_output() {
                info!("fusermount output: {}", String::from_utf8_lossy(&output.stdout));
            }
        }};
    }

    extern "C" fn signal_handler(_: i32) {
        println!("Received signal, unmounting.");
        std::process::exit(0);
    }

    let sig_action = signal::SigAction::new(signal::SigHandler::Handler(signal_handler), signal::SaFlags::SA_NODEFER, signal::SigSet::empty());
    unsafe {
        if let Err(e) = signal::sigaction(signal::SIGINT, &sig_action) {
            warn!("failed to install SIGINT handler: {e:?}");
        }
    }

    let read_only = matches.get_flag("read_only");
    let options = vec![
        if read_only { MountOption::RO } else { MountOption::RW },
        MountOption::FSName("razorfs".to_string()),
    ];
    let retry_times = 3;

    match if matches.get_flag("front") { Ok(Fork::Child) } else { fork() } {
        Ok(Fork::Parent(child)) => {
            info!("Daemon running at pid: {child}");
            Ok(())
        }
        Ok(Fork::Child) => {
            let config = config.clone();
            match retry_with_index(Fixed::from_millis(100), |current_try| {
                info!("[try {current_try}/{retry_times}] Mounting at {abspath_mountpoint}");
                let engine = match Engine::mount(config.clone()) {
                    Ok(e) => e,
                    Err(e) => return OperationResult::Err(format!("engine mount failed: {e}")),
                };
                match fuser::mount2(RazorFuse::new(engine), &abspath_mountpoint, &options) {
                    Ok(()) => {
                        info!("All done.");
                        OperationResult::Ok(())
                    }
                    Err(e) => {
                        if current_try > retry_times {
                            OperationResult::Err(format!("failed to mount after {retry_times} retries: {e}"))
                        } else {
                            umount!();
                            OperationResult::Retry(format!("failed to mount, retrying after unmount: {e}"))
                        }
                    }
                }
            }) {
                Ok(_) => Ok(()),
                Err(e) => Err(anyhow!("mount failed: {}", e)),
            }
        }
        Err(e) => Err(anyhow!("fork returned an error: {e}")),
    }
}
