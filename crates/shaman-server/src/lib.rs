//! # shaman-server
//!
//! The Shaman file store as one service object.
//!
//! [`Shaman`] owns the blob store, the upload coordinator, the requirements
//! negotiator, the checkout manager and the garbage collector. Transport
//! layers call into it; `shamand` drives it from the command line.
//!
//! ## Background tasks
//!
//! [`Shaman::start`] spawns the periodic garbage collector and the diagnostic
//! reporter. Both stop when [`Shaman::shutdown`] cancels the service token;
//! the same token aborts collections and in-flight uploads.

pub mod encoding;
pub mod report;
pub mod requirements;
pub mod upload;

use std::sync::Arc;

use shaman_checkout::{CheckoutError, CheckoutManager, CheckoutPaths, FileEntry};
use shaman_config::{log_server_info, log_server_warn, Config, ConfigError};
use shaman_gc::{GarbageCollector, GcError, GcStats};
use shaman_store::{BlobKey, FileStatus, FileStore, Storage, StoreError, StoreStats};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use encoding::ContentEncoding;
pub use requirements::{RequiredFile, RequirementsNegotiator};
pub use upload::{UploadCoordinator, UploadError, UploadOutcome, UploadRequest};

#[derive(Error, Debug)]
pub enum ShamanError {
    #[error("the Shaman file store is disabled")]
    Disabled,

    #[error("service is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Checkout(#[from] CheckoutError),

    #[error(transparent)]
    Gc(#[from] GcError),
}

pub type Result<T> = std::result::Result<T, ShamanError>;

/// Components of an enabled service.
#[derive(Debug)]
struct Components {
    store: Arc<FileStore>,
    uploads: Arc<UploadCoordinator>,
    requirements: RequirementsNegotiator,
    checkouts: CheckoutManager,
    collector: Arc<GarbageCollector>,
}

impl Components {
    fn new(config: &Config) -> Result<Self> {
        let store = Arc::new(FileStore::new(config.file_store_path())?);
        let checkouts = CheckoutManager::new(config.checkout_path(), store.clone())?;
        let collector = GarbageCollector::new(
            store.clone(),
            checkouts.root(),
            config.garbage_collect.extra_checkout_dirs.clone(),
            config.garbage_collect.max_age(),
        );

        Ok(Self {
            uploads: Arc::new(UploadCoordinator::new(store.clone())),
            requirements: RequirementsNegotiator::new(store.clone()),
            checkouts,
            collector: Arc::new(collector),
            store,
        })
    }
}

/// The file store service.
#[derive(Debug)]
pub struct Shaman {
    config: Config,
    components: Option<Components>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Shaman {
    /// Validate `config` and set up storage. A disabled service touches
    /// nothing on disk.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let components = if config.shaman.enabled {
            let components = Components::new(&config)?;
            log_server_info!(
                "Shaman file store enabled",
                file_store = tracing::field::display(components.store.base_path().display()),
                checkouts = tracing::field::display(components.checkouts.root().display()),
            );
            Some(components)
        } else {
            log_server_info!("Shaman file store disabled");
            None
        };

        Ok(Self {
            config,
            components,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.components.is_some()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Spawn the periodic collector and reporter. Must be called inside a
    /// Tokio runtime. Does nothing when disabled or already started.
    pub fn start(&mut self) {
        let Some(components) = &self.components else {
            return;
        };
        if !self.tasks.is_empty() {
            return;
        }

        self.tasks.push(shaman_gc::spawn_periodic(
            components.collector.clone(),
            self.config.garbage_collect.period(),
            self.cancel.child_token(),
        ));
        self.tasks.push(report::spawn_reporter(
            components.store.clone(),
            components.uploads.clone(),
            self.config.report.interval(),
            self.cancel.child_token(),
        ));
        log_server_info!("Background tasks started", tasks = self.tasks.len());
    }

    /// Cancel background work and wait for it to finish.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                log_server_warn!("Background task ended abnormally", error = tracing::field::display(&e));
            }
        }
        log_server_info!("Shaman file store stopped");
    }

    /// Token cancelled by [`Shaman::shutdown`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn components(&self) -> Result<&Components> {
        self.components.as_ref().ok_or(ShamanError::Disabled)
    }

    /// Status of a blob: `unknown`, `uploading` or `stored`.
    pub fn file_status(&self, key: &BlobKey) -> Result<FileStatus> {
        Ok(self.components()?.uploads.status(key))
    }

    /// Receive an upload body for `request.key`. Aborted with
    /// [`ShamanError::ShuttingDown`] when the service shuts down.
    pub async fn receive_file<R>(&self, body: R, request: UploadRequest) -> Result<UploadOutcome>
    where
        R: AsyncRead + Unpin,
    {
        let uploads = &self.components()?.uploads;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ShamanError::ShuttingDown),
            outcome = uploads.receive_file(body, request) => Ok(outcome?),
        }
    }

    /// Entries of an upcoming checkout the client still has to upload.
    pub fn requirements(&self, entries: &[FileEntry]) -> Result<Vec<RequiredFile>> {
        Ok(self.components()?.requirements.requirements(entries)?)
    }

    /// Create a checkout; the returned ID may carry a uniqueness suffix.
    pub fn create_checkout(&self, checkout_id: &str, entries: &[FileEntry]) -> Result<CheckoutPaths> {
        Ok(self.components()?.checkouts.create_checkout(checkout_id, entries)?)
    }

    pub fn erase_checkout(&self, checkout_id: &str) -> Result<()> {
        Ok(self.components()?.checkouts.erase(checkout_id)?)
    }

    /// Run one collection now, on the blocking pool.
    pub async fn garbage_collect(&self, dry_run: bool) -> Result<GcStats> {
        let collector = self.components()?.collector.clone();
        Ok(shaman_gc::collect_in_background(collector, dry_run, self.cancel.child_token()).await?)
    }

    pub fn store_stats(&self) -> Result<StoreStats> {
        Ok(self.components()?.store.stats()?)
    }
}
