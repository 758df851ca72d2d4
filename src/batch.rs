//! Running shadow, debloat, restore and remount over a list of images.
//!
//! Each step runs over all images before the next step starts, so that images
//! sharing layers see the same storage state.  A failing image is recorded in the
//! [`BatchReport`] and the batch moves on without it.  The engine is restarted at most
//! once per batch, after every image has been processed, and only when some
//! image actually changed state.

use std::fmt;

use log::{error, info, warn};

use crate::{
    config::Config,
    engine::ContainerEngine,
    error::{Error, Result},
    export::{ExportOutcome, ExportPipeline, ExportedImage},
    layer::RestoreOutcome,
    mount::unmount_stack,
    shadow::{ShadowEngine, ShadowOutcome, ShadowPlan, ShadowState},
    util::wait_until,
};

/// What happened to each image of a batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    /// Image and the reason it needed no work.
    pub skipped: Vec<(String, String)>,
    /// Image and the error that stopped it.
    pub failed: Vec<(String, String)>,
}

impl BatchReport {
    fn succeed(&mut self, image: &str) {
        self.succeeded.push(image.to_string());
    }

    fn skip(&mut self, image: &str, reason: &str) {
        info!("skipping {image}: {reason}");
        self.skipped.push((image.to_string(), reason.to_string()));
    }

    fn fail(&mut self, image: &str, err: &Error) {
        error!("{image}: {err}");
        self.failed.push((image.to_string(), err.to_string()));
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for image in &self.succeeded {
            writeln!(f, "ok       {image}")?;
        }
        for (image, reason) in &self.skipped {
            writeln!(f, "skipped  {image}: {reason}")?;
        }
        for (image, err) in &self.failed {
            writeln!(f, "failed   {image}: {err}")?;
        }
        Ok(())
    }
}

/// Current state of one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageStatus {
    pub image: String,
    pub state: ShadowState,
    pub layers: usize,
    /// Bytes recorded under the shadow layers' `real/`; `None` when unshadowed.
    pub real_bytes: Option<u64>,
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}, {} layers", self.image, self.state, self.layers)?;
        if let Some(bytes) = self.real_bytes {
            write!(f, ", {bytes} bytes observed")?;
        }
        Ok(())
    }
}

/// Batch operations over one engine.
pub struct Batch<'a, E: ContainerEngine> {
    shadow: ShadowEngine<'a, E>,
}

impl<'a, E: ContainerEngine> Batch<'a, E> {
    pub fn new(engine: &'a E, config: &'a Config) -> Result<Self> {
        Ok(Batch {
            shadow: ShadowEngine::new(engine, config)?,
        })
    }

    pub fn shadow_engine(&self) -> &ShadowEngine<'a, E> {
        &self.shadow
    }

    fn engine(&self) -> &'a E {
        self.shadow.engine()
    }

    fn config(&self) -> &'a Config {
        self.shadow.config()
    }

    /// Restarts the engine and waits until it answers again.
    pub fn restart_engine(&self) -> Result<()> {
        info!("restarting container engine");
        let engine = self.engine();
        engine.restart()?;
        wait_until(
            "container engine to become ready",
            self.config().engine_ready_timeout(),
            self.config().poll_interval(),
            || Ok(engine.is_ready()),
        )
    }

    /// Starts the filtering mounts of a plan; returns how many were started.
    fn mount_plan(&self, plan: &ShadowPlan) -> Result<usize> {
        let mut started = 0;
        for mount in plan.mounts(self.config()) {
            if mount.mount(&self.config().mount_type)? {
                started += 1;
            }
        }
        Ok(started)
    }

    /// Shadows every image, restarts the engine once, then starts the filtering mounts.
    ///
    /// Every image is planned before any is materialized: images sharing a base layer
    /// must all be resolved while the engine still reports the original layers.  The
    /// restart has to come before mounting, since the engine only follows the redirected
    /// identities after it re-reads them.
    pub fn shadow(&self, images: &[String]) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        let mut plans = vec![];
        for image in images {
            match self.shadow.plan(image) {
                Ok(ShadowOutcome::Shadowed(plan)) => plans.push(plan),
                Ok(ShadowOutcome::AlreadyShadowed) => report.skip(image, "already shadowed"),
                Err(err) => report.fail(image, &err),
            }
        }

        let mut shadowed = vec![];
        for plan in plans {
            match plan.materialize() {
                Ok(()) => {
                    info!("shadowed {}", plan.image());
                    shadowed.push(plan);
                }
                Err(err) => report.fail(plan.image(), &err),
            }
        }

        if shadowed.is_empty() {
            return Ok(report);
        }
        self.restart_engine()?;

        for plan in &shadowed {
            match self.mount_plan(plan) {
                Ok(started) => {
                    info!("{}: started {started} filtering mounts", plan.image());
                    report.succeed(plan.image());
                }
                Err(err) => report.fail(plan.image(), &err),
            }
        }
        Ok(report)
    }

    /// Exports every shadowed image, then restores their identities, restarts the engine
    /// once and loads the debloated archives.
    ///
    /// No identity is restored before every export is done, so images sharing a base
    /// layer still resolve to its shadow.
    pub fn debloat(&self, images: &[String], top: Option<usize>) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        let pipeline = ExportPipeline::new(&self.shadow);
        let mut exports: Vec<ExportedImage> = vec![];
        for image in images {
            match pipeline.export(image, top) {
                Ok(ExportOutcome::Exported(export)) => exports.push(export),
                Ok(ExportOutcome::NotShadowed) => report.skip(image, "not shadowed"),
                Err(err) => report.fail(image, &err),
            }
        }

        let mut restored = vec![];
        for export in exports {
            match export.plan.restore() {
                Ok(_) => restored.push(export),
                Err(err) => report.fail(&export.image, &err),
            }
        }

        if restored.is_empty() {
            return Ok(report);
        }
        self.restart_engine()?;

        for export in &restored {
            match self.engine().load_image(&export.archive) {
                Ok(status) => {
                    info!("{}: {status}", export.image);
                    report.succeed(&export.image);
                }
                Err(err) => report.fail(&export.image, &err),
            }
        }
        Ok(report)
    }

    /// Takes down the filtering mounts of every shadowed image and points its identities
    /// back at the original layers, then restarts the engine once.
    pub fn restore(&self, images: &[String]) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        for image in images {
            match self.restore_one(image) {
                Ok(true) => report.succeed(image),
                Ok(false) => report.skip(image, "not shadowed"),
                Err(err) => report.fail(image, &err),
            }
        }

        if !report.succeeded.is_empty() {
            self.restart_engine()?;
        }
        Ok(report)
    }

    /// Unmounts the stack the engine reports before anything else: a dead filtering mount
    /// leaves its `diff` unreadable.  The identities are then restored from the identity
    /// store alone.
    fn restore_one(&self, image: &str) -> Result<bool> {
        let inspect = self.engine().inspect_image(image)?;
        if ShadowState::detect(&inspect.graph_driver)? == ShadowState::Unshadowed {
            return Ok(false);
        }
        unmount_stack(&inspect.graph_driver.layer_dirs()?, self.config())?;
        for outcome in self.shadow.restore_identities(image, &inspect)? {
            if outcome == RestoreOutcome::NoBackup {
                warn!("{image}: a layer had no cache-id backup and was left as is");
            }
        }
        Ok(true)
    }

    /// Starts any filtering mounts missing for shadowed images, e.g. after a reboot.
    pub fn remount(&self, images: &[String]) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        for image in images {
            let result = self
                .shadow
                .current_layers(image)
                .and_then(|plan| plan.map(|plan| self.mount_plan(&plan)).transpose());
            match result {
                Ok(Some(started)) => {
                    info!("{image}: started {started} filtering mounts");
                    report.succeed(image);
                }
                Ok(None) => report.skip(image, "not shadowed"),
                Err(err) => report.fail(image, &err),
            }
        }
        Ok(report)
    }

    /// Reports the state of every image.
    pub fn status(&self, images: &[String]) -> (Vec<ImageStatus>, BatchReport) {
        let mut statuses = vec![];
        let mut report = BatchReport::default();
        for image in images {
            match self.status_one(image) {
                Ok(status) => {
                    statuses.push(status);
                    report.succeed(image);
                }
                Err(err) => report.fail(image, &err),
            }
        }
        (statuses, report)
    }

    fn status_one(&self, image: &str) -> Result<ImageStatus> {
        let inspect = self.engine().inspect_image(image)?;
        let status = match self.shadow.current_layers_of(image, &inspect)? {
            Some(plan) => ImageStatus {
                image: image.to_string(),
                state: ShadowState::Shadowed,
                layers: plan.shadows().len(),
                real_bytes: Some(plan.real_size()?),
            },
            None => ImageStatus {
                image: image.to_string(),
                state: ShadowState::Unshadowed,
                layers: inspect.root_fs.layers.len(),
                real_bytes: None,
            },
        };
        Ok(status)
    }
}
