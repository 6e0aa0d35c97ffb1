use std::sync::Arc;

use thiserror::Error;
use tokio::select;

use crate::app_config;
use compressfs::fs::{CompressFs, MountError, MountOptions};
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to mount backend: {0}")]
    Mount(#[from] MountError),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

mod managed_fuse {
    //! fuser only performs a regular unmount when the `BackgroundSession` is dropped. A busy
    //! mount would then linger, so [`ManagedFuse`] follows up with a lazy detach.
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use nix::errno::Errno;

    use super::{CompressFs, app_config, debug, error};
    use compressfs::fs::fuser::FuserAdapter;
    use fuser::BackgroundSession;

    pub struct FuseCoreScope {
        _session: BackgroundSession,
    }

    impl FuseCoreScope {
        fn spawn(
            fs: Arc<CompressFs>,
            config: &app_config::Config,
            handle: tokio::runtime::Handle,
        ) -> Result<Self, std::io::Error> {
            let fuse_adapter = FuserAdapter::new(fs, handle)
                .with_ttl(Duration::from_secs(config.mount.attr_ttl_secs));

            let mut mount_opts = vec![
                fuser::MountOption::FSName(config.mount.fs_name.clone()),
                fuser::MountOption::Subtype("compressfs".to_owned()),
                fuser::MountOption::RW,
                fuser::MountOption::NoDev,
                fuser::MountOption::NoSuid,
                fuser::MountOption::DefaultPermissions,
            ];
            if config.mount.allow_other {
                mount_opts.push(fuser::MountOption::AllowOther);
                mount_opts.push(fuser::MountOption::AutoUnmount);
            }

            Ok(Self {
                _session: fuser::spawn_mount2(fuse_adapter, &config.mount_point, &mount_opts)?,
            })
        }
    }

    pub struct ManagedFuse {
        mount_point: PathBuf,
    }

    impl ManagedFuse {
        pub fn new(config: &app_config::Config) -> Self {
            Self {
                mount_point: config.mount_point.clone(),
            }
        }

        pub fn spawn(
            &self,
            fs: Arc<CompressFs>,
            config: &app_config::Config,
            handle: tokio::runtime::Handle,
        ) -> Result<FuseCoreScope, std::io::Error> {
            _ = self; // self used for calling convention.
            FuseCoreScope::spawn(fs, config, handle)
        }
    }

    impl Drop for ManagedFuse {
        fn drop(&mut self) {
            const UMOUNT_ATTEMPT_COUNT: usize = 10;
            const UMOUNT_ATTEMPT_DELAY: Duration = Duration::from_millis(10);

            debug!(mount_point = ?self.mount_point, "Confirming unmount of FUSE filesystem...");

            for i in 0..UMOUNT_ATTEMPT_COUNT {
                let result = {
                    #[cfg(target_os = "macos")]
                    {
                        nix::mount::unmount(&self.mount_point, nix::mount::MntFlags::MNT_FORCE)
                    }

                    #[cfg(target_os = "linux")]
                    {
                        nix::mount::umount2(&self.mount_point, nix::mount::MntFlags::MNT_DETACH)
                    }
                };

                match result {
                    Ok(()) => {
                        debug!(attempt = i + 1, "Unmounted FUSE filesystem.");
                        break;
                    }
                    Err(Errno::EBUSY) => {
                        debug!(attempt = i + 1, "FUSE filesystem still busy. Retrying...");
                        std::thread::sleep(UMOUNT_ATTEMPT_DELAY);
                    }
                    Err(Errno::EINVAL | Errno::ENOENT | Errno::EPERM) => {
                        debug!(attempt = i + 1, "FUSE filesystem already unmounted.");
                        break;
                    }
                    Err(e) => {
                        error!(attempt = i + 1, "Failed to unmount FUSE filesystem: {e}");
                        break;
                    }
                }
            }
        }
    }
}

/// Prepares the mount point directory.
///
/// - If the directory exists and is non-empty, returns an error.
/// - If the directory does not exist, creates it (including parents) and logs an info message.
/// - If the directory exists and is empty, does nothing.
async fn prepare_mount_point(mount_point: &std::path::Path) -> Result<(), std::io::Error> {
    match tokio::fs::read_dir(mount_point).await {
        Ok(mut entries) => {
            if entries.next_entry().await?.is_some() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!(
                        "Mount point '{}' already exists and is not empty.",
                        mount_point.display()
                    ),
                ));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(mount_point).await?;
            info!(path = %mount_point.display(), "Created mount point directory.");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
    select! {
        _ = signal::ctrl_c() => {
            debug!("Received Ctrl+C signal, shutting down...");
        },
        _ = sigterm.recv() => {
            debug!("Received termination signal, shutting down...");
        },
        _ = sighup.recv() => {
            debug!("Received hangup signal, shutting down...");
        },
    }
    Ok(())
}

/// Main entry point for the daemon.
pub async fn run(
    config: app_config::Config,
    handle: tokio::runtime::Handle,
) -> Result<(), DaemonError> {
    prepare_mount_point(&config.mount_point).await?;

    let options = MountOptions {
        codec: config.codec,
        open_policy: config.cache.open_policy,
    };
    let backend = config.backend.clone();
    let fs = tokio::task::spawn_blocking(move || CompressFs::mount(backend, options))
        .await
        .map_err(std::io::Error::other)??;
    let fs = Arc::new(fs);

    info!("Mounting filesystem at {}.", config.mount_point.display());

    let fuse = managed_fuse::ManagedFuse::new(&config);
    {
        let _session = fuse.spawn(Arc::clone(&fs), &config, handle.clone())?;
        info!("compressfs is running. Press Ctrl+C to stop.");

        wait_for_exit().await?;
    }

    // The kernel normally triggers this through `destroy`; a lazily detached mount may not.
    tokio::task::spawn_blocking(move || fs.shutdown())
        .await
        .map_err(std::io::Error::other)?;
    Ok(())
}

pub fn spawn(config: app_config::Config) -> Result<(), DaemonError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config, runtime.handle().clone()))
}
