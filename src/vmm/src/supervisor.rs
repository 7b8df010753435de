//! Builds every guest and runs each on its own thread (spec.md §4.6).

use std::sync::Mutex;
use std::thread;

use crate::config::Config;
use crate::devices::file_table::SharedFiles;
use crate::guest::Guest;
use crate::{Error, HostVmm, Result};

pub struct GuestSupervisor;

impl GuestSupervisor {
    /// Construct every guest sequentially first: a `HostSetupError` or
    /// `ImageLoadError` (spec.md §7) here is fatal to the whole process and
    /// nothing is spawned. Once every guest exists, each runs on its own
    /// thread; a guest-local `ProtocolViolation`/`InternalError` aborts only
    /// that guest's loop (logged on its thread) while the others keep
    /// running. This call still returns `Err` once every thread has joined
    /// if any guest failed, so the process exit status reflects it.
    pub fn run(vmm: &HostVmm, config: &Config) -> Result<()> {
        let shared = SharedFiles::new(config.shared_files.clone());
        let open_lock = Mutex::new(());

        let mut guests = Vec::with_capacity(config.guests.len());
        for (id, image) in config.guests.iter().enumerate() {
            let guest = Guest::new(vmm, id as u32, config.memory_size, config.page_size, &image.path)?;
            guests.push(guest);
        }

        let failures = thread::scope(|scope| {
            let handles: Vec<_> = guests
                .into_iter()
                .map(|guest| {
                    let id = guest.id;
                    let shared = &shared;
                    let open_lock = &open_lock;
                    scope.spawn(move || {
                        let mut dispatcher = guest.into_dispatcher(shared, open_lock);
                        let result = dispatcher.run();
                        if let Err(ref e) = result {
                            eprintln!("guest {id}: terminated with error: {e:?}");
                        }
                        result
                    })
                })
                .collect();

            handles.into_iter().fold(0usize, |failures, handle| match handle.join() {
                Ok(Ok(())) => failures,
                _ => failures + 1,
            })
        });

        if failures > 0 {
            return Err(Error::GuestFailed(failures));
        }
        Ok(())
    }
}
