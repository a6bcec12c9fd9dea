//! CLI argument parsing and config-directory conventions (ambient
//! addition; grounded in the teacher's `bin/ebeans/args.rs`: a `clap`
//! derive `Args` struct with short/long flags and typed defaults).

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use clap::Parser;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)))]
    pub listen: IpAddr,
    /// (TCP) port to listen on.
    #[arg(short, long, default_value_t = 7419)]
    pub port: u16,
    /// Directory holding the ordered KV backend's files.
    #[arg(short = 'D', long, default_value = "./faktory-data")]
    pub data_dir: PathBuf,
    /// Directory consulted for a `password` file (spec §6).
    #[arg(short = 'c', long, default_value = "./faktory-config")]
    pub config_dir: PathBuf,
    /// Overrides the config-directory password file with an explicit path.
    #[arg(long)]
    pub password_file: Option<PathBuf>,
    /// Floor (seconds) applied to a job's `reserve_for` when computing a
    /// reservation's lease.
    #[arg(long, default_value_t = 60)]
    pub reserve_for_floor: u32,
    /// Age, in days, past which a dead-set entry is purged.
    #[arg(long, default_value_t = 180)]
    pub dead_max_age_days: i64,
    /// Maximum dead-set size; oldest entries are purged past this.
    #[arg(long, default_value_t = 10_000)]
    pub dead_max_count: u64,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub debug: bool,
}

/// Loads the shared secret from `explicit`, or `<config_dir>/password` if
/// `explicit` is `None`. A missing file disables authentication (spec §6).
pub fn load_password(config_dir: &Path, explicit: Option<&Path>) -> std::io::Result<Option<String>> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => config_dir.join("password"),
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(contents
            .lines()
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
