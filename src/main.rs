use clap::Parser;

use vmm::{Config, GuestSupervisor, HostVmm};

/// Minimal hardware-assisted hypervisor: launches one or more guests
/// concurrently and services their console and file-service I/O.
#[derive(Parser)]
#[clap(version = "0.1")]
struct VMMOpts {
    /// Guest memory size in MiB, applied to every guest.
    #[clap(short, long, default_value = "4")]
    memory: u32,

    /// Page size: 4 selects 4 KiB pages, any other value selects 2 MiB huge
    /// pages.
    #[clap(short, long, default_value = "2")]
    page: u32,

    /// One or more guest image paths.
    #[clap(short, long, num_args = 1.., required = true)]
    guest: Vec<String>,

    /// Zero or more shared file names, readable read-only by every guest.
    #[clap(short, long, num_args = 1..)]
    file: Vec<String>,
}

#[derive(Debug)]
enum Error {
    Config(vmm::config::Error),
    Vmm(vmm::Error),
}

fn run() -> Result<(), Error> {
    let opts = VMMOpts::parse();

    let mut builder = Config::builder(opts.memory, opts.page);
    for image in opts.guest {
        builder = builder.guest(image);
    }
    for name in opts.file {
        builder = builder.shared_file(name);
    }
    let config = builder.build().map_err(Error::Config)?;

    let host_vmm = HostVmm::new().map_err(Error::Vmm)?;
    GuestSupervisor::run(&host_vmm, &config).map_err(Error::Vmm)?;

    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("multivmm: {e:?}");
        std::process::exit(1);
    }
}
