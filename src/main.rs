use std::env;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::{Arg, ArgAction, Command, crate_version};
use fuser::MountOption;
use log::{LevelFilter, debug, error};

use brokenfuse::backing::{Backing, DirBacking, MemBacking};
use brokenfuse::clock::{SharedRng, SystemClock};
use brokenfuse::{BrokenFs, Engine};

const EXIT_USAGE: i32 = 1;
const EXIT_MOUNT: i32 = 2;
const EXIT_BACKING: i32 = 3;

fn main() {
    let matches = Command::new("brokenfuse")
        .version(crate_version!())
        .arg(
            Arg::new("mountpoint")
                .value_name("MOUNTPOINT")
                .required(true)
                .help("Directory to mount the filesystem at"),
        )
        .arg(
            Arg::new("backing")
                .long("backing")
                .value_name("DIR")
                .help("Forward to this directory; without it an empty in-memory tree is served"),
        )
        .arg(
            Arg::new("auto-unmount")
                .long("auto-unmount")
                .action(ArgAction::SetTrue)
                .help("Automatically unmount when the process exits"),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .help("Sets the level of verbosity"),
        )
        .try_get_matches()
        .unwrap_or_else(|e| {
            // Help/version requests are not usage errors.
            if e.use_stderr() {
                let _ = e.print();
                exit(EXIT_USAGE);
            }
            let _ = e.print();
            exit(0);
        });

    let log_level = match matches.get_count("v") {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::builder()
        .format_timestamp_nanos()
        .filter_level(log_level)
        .init();

    let rng = match env::var("BF_SEED") {
        Ok(raw) => match raw.parse::<u64>() {
            Ok(seed) => {
                debug!("seeding RNG with BF_SEED={seed}");
                SharedRng::seeded(seed)
            }
            Err(_) => {
                eprintln!("BF_SEED must be a 64-bit unsigned integer, got {raw:?}");
                exit(EXIT_USAGE);
            }
        },
        Err(_) => SharedRng::from_os(),
    };

    let backing: Arc<dyn Backing> = match matches.get_one::<String>("backing") {
        Some(dir) => {
            let root = PathBuf::from(dir);
            match std::fs::metadata(&root) {
                Ok(meta) if meta.is_dir() => Arc::new(DirBacking::new(root)),
                Ok(_) => {
                    error!("backing path {} is not a directory", root.display());
                    exit(EXIT_BACKING);
                }
                Err(e) => {
                    error!("cannot use backing directory {}: {e}", root.display());
                    exit(EXIT_BACKING);
                }
            }
        }
        None => Arc::new(MemBacking::new()),
    };

    let engine = Engine::new(backing, Arc::new(SystemClock), Arc::new(rng));
    let filesystem = BrokenFs::new(engine);

    let mut options = vec![
        MountOption::FSName("brokenfuse".to_string()),
        MountOption::DefaultPermissions,
    ];
    if matches.get_flag("auto-unmount") {
        options.push(MountOption::AutoUnmount);
    }

    let mountpoint = matches.get_one::<String>("mountpoint").unwrap();
    if let Err(e) = fuser::mount2(filesystem, mountpoint, &options) {
        error!("mount failed: {e}");
        exit(EXIT_MOUNT);
    }
}
