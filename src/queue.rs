//! Sequential replay of assembled parameters against the service.
//!
//! Items run strictly one after another. The queue mirrors the service's
//! active model and decoder so a switch is only issued when the next item
//! needs a different one; sorted input therefore needs one switch per group.

use crate::config::AppConfig;
use crate::decoders::DecoderRoster;
use crate::error::{ReplayError, Result, VerifyError};
use crate::forge_api::{ForgeBackend, GenerationResponse, ModelInfo};
use crate::fsops;
use crate::image_decode::{decode_image_payload, DecodedImage};
use crate::params::{FaceRestoration, GenerationParameters, DECODER_NONE};
use crate::payload::{
    build_generation_payload, build_restoration_request, ReplayMode, RestorationRequest,
};
use crate::verify::{self, Classification, Comparison};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const REPRODUCED_SUFFIX: &str = "-reproduced";
const SIDECAR_EXTENSION: &str = "txt";

/// What the queue believes is loaded on the service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub model: Option<String>,
    pub decoder: Option<String>,
}

/// Shared view of the queue's remaining work, for the Ctrl-C hook.
#[derive(Debug, Clone, Default)]
pub struct QueueHandle {
    pending: Arc<AtomicUsize>,
}

impl QueueHandle {
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn set(&self, count: usize) {
        self.pending.store(count, Ordering::SeqCst);
    }

    fn finish_one(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                Some(count.saturating_sub(1))
            });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Verification {
    pub comparison: Comparison,
    pub classification: Classification,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ReplayOutcome {
    Succeeded {
        sidecar: PathBuf,
        output: PathBuf,
        verification: Option<Verification>,
    },
    Failed {
        sidecar: PathBuf,
        message: String,
    },
}

impl ReplayOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub mode: ReplayMode,
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
    pub succeeded: usize,
    pub total: usize,
    pub outcomes: Vec<ReplayOutcome>,
}

impl RunSummary {
    /// `succeeded/total`, e.g. `3/3`.
    pub fn completion(&self) -> String {
        format!("{}/{}", self.succeeded, self.total)
    }

    pub fn reproducible(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| {
                matches!(
                    outcome,
                    ReplayOutcome::Succeeded {
                        verification: Some(Verification {
                            classification: Classification::Reproducible,
                            ..
                        }),
                        ..
                    }
                )
            })
            .count()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} run started {} completed {} in {:.1}s",
            self.mode,
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            self.completion(),
            self.elapsed.as_secs_f64()
        )?;
        if self.mode == ReplayMode::Reproduce {
            write!(f, " ({} reproducible)", self.reproducible())?;
        }
        Ok(())
    }
}

/// One replay run. Owns the session state; not shared between runs.
pub struct GenerationQueue<'a, B: ForgeBackend> {
    backend: &'a B,
    mode: ReplayMode,
    root: PathBuf,
    config: &'a AppConfig,
    handle: QueueHandle,
    session: SessionState,
    models: Vec<ModelInfo>,
    decoders: DecoderRoster,
    refreshed: bool,
}

impl<'a, B: ForgeBackend> GenerationQueue<'a, B> {
    pub fn new(backend: &'a B, mode: ReplayMode, root: &Path, config: &'a AppConfig) -> Self {
        Self {
            backend,
            mode,
            root: root.to_path_buf(),
            config,
            handle: QueueHandle::default(),
            session: SessionState::default(),
            models: Vec::new(),
            decoders: DecoderRoster::default(),
            refreshed: false,
        }
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    /// Replays every item in order and resolves once the last one finished.
    ///
    /// Only the start-of-run state reads can fail the run; item failures are
    /// recorded in the summary.
    pub async fn run(mut self, items: Vec<GenerationParameters>) -> Result<RunSummary> {
        let started_at = Local::now();
        let clock = Instant::now();
        let total = items.len();
        let mut queue: VecDeque<GenerationParameters> = items.into();
        self.handle.set(total);

        self.start_session().await?;
        log::info!("{:?} run: {} item(s) queued", self.mode, total);

        let mut outcomes = Vec::with_capacity(total);
        let mut succeeded = 0usize;
        while let Some(item) = queue.pop_front() {
            let position = outcomes.len() + 1;
            let outcome = match self.replay(&item).await {
                Ok(outcome) => {
                    succeeded += 1;
                    outcome
                }
                Err(error) => {
                    log::error!("[{}/{}] {} failed: {}", position, total, item.file_name(), error);
                    ReplayOutcome::Failed {
                        sidecar: item.sidecar_path.clone(),
                        message: error.to_string(),
                    }
                }
            };
            outcomes.push(outcome);
            self.handle.finish_one();
            log::info!("Progress: {}/{} done", position, total);
        }

        let summary = RunSummary {
            mode: self.mode,
            started_at,
            elapsed: clock.elapsed(),
            succeeded,
            total,
            outcomes,
        };
        log::info!("{}", summary);
        Ok(summary)
    }

    async fn start_session(&mut self) -> Result<()> {
        let options = self.backend.options().await?;
        self.models = self.backend.models().await?;
        self.decoders = DecoderRoster::fetch(self.backend, self.config.vae_dir.as_deref()).await?;

        self.session.model = options.sd_model_checkpoint.as_deref().map(|checkpoint| {
            self.models
                .iter()
                .find(|model| {
                    model.matches_name(checkpoint)
                        || options
                            .sd_checkpoint_hash
                            .as_deref()
                            .is_some_and(|hash| model.matches_hash(hash))
                })
                .map(|model| model.canonical_name().to_string())
                .unwrap_or_else(|| checkpoint.to_string())
        });
        self.session.decoder = options.sd_vae;
        log::info!(
            "Session: model {}, decoder {}",
            self.session.model.as_deref().unwrap_or("<none>"),
            self.session.decoder.as_deref().unwrap_or("<none>")
        );
        Ok(())
    }

    async fn replay(&mut self, item: &GenerationParameters) -> Result<ReplayOutcome, ReplayError> {
        if !item.image_path.is_file() {
            log::warn!(
                "Skipping {}: paired image {} is missing",
                item.file_name(),
                item.image_path.display()
            );
            return Err(ReplayError::MissingImage(item.image_path.clone()));
        }

        let payload = build_generation_payload(item, self.mode);
        self.ensure_model(item).await?;
        self.ensure_decoder(item).await;

        let response = self.generate(&payload).await?;
        let first = response.images.first().ok_or(ReplayError::EmptyResponse)?;
        let mut image = decode_image_payload(first)?;
        let infotext = response.infotext().unwrap_or_else(|| item.raw_text.clone());

        if let Some(restoration) = &item.face_restoration {
            image = self.restore_faces(item, restoration, image).await;
        }

        let sidecar_text = compose_sidecar(&infotext, item);
        match self.mode {
            ReplayMode::Upscale => self.place_upscaled(item, &image, &sidecar_text),
            ReplayMode::Reproduce => self.place_reproduced(item, &image, &sidecar_text),
        }
    }

    /// Switches the checkpoint if the session has a different one loaded.
    /// The roster is refreshed at most once per run before giving up.
    async fn ensure_model(&mut self, item: &GenerationParameters) -> Result<(), ReplayError> {
        let wanted = &item.model;
        if self.session.model.as_deref() == Some(wanted.name.as_str()) {
            return Ok(());
        }

        let mut target = self.find_model(&wanted.name, wanted.hash.as_deref());
        if target.is_none() && !self.refreshed {
            log::info!("Model {} not in roster; refreshing checkpoints", wanted.name);
            self.refreshed = true;
            self.backend.refresh_models().await?;
            self.models = self.backend.models().await?;
            target = self.find_model(&wanted.name, wanted.hash.as_deref());
        }
        let target = target.ok_or_else(|| ReplayError::UnknownModel(wanted.name.clone()))?;

        if self.session.model.as_deref() == Some(target.as_str()) {
            return Ok(());
        }
        self.backend.set_model(&target).await?;
        log::info!(
            "Model: {} -> {}",
            self.session.model.as_deref().unwrap_or("<none>"),
            target
        );
        self.session.model = Some(target);
        Ok(())
    }

    fn find_model(&self, name: &str, hash: Option<&str>) -> Option<String> {
        self.models
            .iter()
            .find(|model| model.canonical_name() == name || model.matches_name(name))
            .or_else(|| {
                hash.and_then(|hash| self.models.iter().find(|model| model.matches_hash(hash)))
            })
            .map(|model| model.canonical_name().to_string())
    }

    /// Applies the item's decoder; items without one run with `None`. The
    /// service only reliably reloads a decoder when switched
    /// target → None → target.
    async fn ensure_decoder(&mut self, item: &GenerationParameters) {
        let target = match &item.decoder {
            Some(reference) => self.decoders.resolve(reference),
            None => DECODER_NONE.to_string(),
        };
        if self.session.decoder.as_deref() == Some(target.as_str()) {
            return;
        }

        for value in [target.as_str(), DECODER_NONE, target.as_str()] {
            if let Err(error) = self.backend.set_decoder(value).await {
                log::warn!("Decoder switch to {} failed: {}", value, error);
                self.session.decoder = None;
                return;
            }
        }
        log::info!(
            "Decoder: {} -> {}",
            self.session.decoder.as_deref().unwrap_or("<none>"),
            target
        );
        self.session.decoder = Some(target);
    }

    /// Runs `txt2img`, logging service progress while the request is open.
    async fn generate(
        &self,
        payload: &crate::payload::GenerationPayload,
    ) -> Result<GenerationResponse, ReplayError> {
        let request = self.backend.txt2img(payload);
        tokio::pin!(request);

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.tick().await;

        loop {
            tokio::select! {
                result = &mut request => return Ok(result?),
                _ = ticker.tick() => {
                    match self.backend.progress().await {
                        Ok(progress) => log::info!(
                            "Generating: {:.0}% (eta {:.1}s)",
                            progress.progress * 100.0,
                            progress.eta_relative
                        ),
                        Err(error) => log::debug!("Progress poll failed: {}", error),
                    }
                }
            }
        }
    }

    /// Post-pass face restoration; on failure the unrestored image is kept.
    async fn restore_faces(
        &self,
        item: &GenerationParameters,
        restoration: &FaceRestoration,
        image: DecodedImage,
    ) -> DecodedImage {
        match self.try_restore_faces(item, restoration, &image).await {
            Ok(restored) => {
                log::info!(
                    "Restored faces with {:?} at strength {}",
                    restoration.method,
                    restoration.strength
                );
                restored
            }
            Err(error) => {
                log::warn!(
                    "Face restoration failed for {}: {}; keeping unrestored image",
                    item.file_name(),
                    error
                );
                image
            }
        }
    }

    async fn try_restore_faces(
        &self,
        item: &GenerationParameters,
        restoration: &FaceRestoration,
        image: &DecodedImage,
    ) -> Result<DecodedImage, ReplayError> {
        let size = image
            .dimensions()
            .map_err(|error| ReplayError::Verify(VerifyError::Decode(error)))?;
        let restored = match build_restoration_request(item, restoration, &image.to_base64(), size) {
            RestorationRequest::Extras(extras) => self.backend.extra_single_image(&extras).await?,
            RestorationRequest::Img2Img(payload) => self
                .backend
                .img2img(&payload)
                .await?
                .images
                .into_iter()
                .next()
                .ok_or(ReplayError::EmptyResponse)?,
        };
        decode_image_payload(&restored)
    }

    fn place_upscaled(
        &self,
        item: &GenerationParameters,
        image: &DecodedImage,
        sidecar_text: &str,
    ) -> Result<ReplayOutcome, ReplayError> {
        let folders = &self.config.folders;
        let relative = fsops::relative_dir(&self.root, &item.sidecar_path);
        let stem = item.file_name();

        let output_dir = self.root.join(&folders.upscaled).join(&relative);
        let (output, _) = fsops::write_pair(
            &output_dir,
            &stem,
            (image.ext, &image.bytes),
            (SIDECAR_EXTENSION, sidecar_text.as_bytes()),
        )?;

        let completed_dir = self.root.join(&folders.sources_completed).join(&relative);
        fsops::move_pair(&item.image_path, &item.sidecar_path, &completed_dir)?;

        log::info!("Upscaled {} -> {}", item.file_name(), output.display());
        Ok(ReplayOutcome::Succeeded {
            sidecar: item.sidecar_path.clone(),
            output,
            verification: None,
        })
    }

    fn place_reproduced(
        &self,
        item: &GenerationParameters,
        image: &DecodedImage,
        sidecar_text: &str,
    ) -> Result<ReplayOutcome, ReplayError> {
        let comparison = match verify::compare_with_original(
            &item.image_path,
            &image.bytes,
            self.config.pixel_threshold,
        ) {
            Ok(comparison) => comparison,
            Err(VerifyError::DimensionMismatch { left, right }) => {
                log::warn!(
                    "{}: size changed from {:?} to {:?}",
                    item.file_name(),
                    left,
                    right
                );
                let total = u64::from(left.0) * u64::from(left.1);
                Comparison {
                    diff_pixels: total,
                    total_pixels: total,
                    percent_diff: 1.0,
                }
            }
            Err(error) => return Err(error.into()),
        };
        let classification = verify::classify(comparison.percent_diff, self.config.tolerance);

        let folders = &self.config.folders;
        let bucket = match classification {
            Classification::Reproducible => &folders.reproducible,
            Classification::NonReproducible => &folders.non_reproducible,
        };
        let relative = fsops::relative_dir(&self.root, &item.sidecar_path);
        let output_dir = self.root.join(&folders.reproduce).join(bucket).join(relative);

        fsops::move_pair(&item.image_path, &item.sidecar_path, &output_dir)?;

        let stem = format!("{}{REPRODUCED_SUFFIX}", item.file_name());
        let (output, _) = fsops::write_pair(
            &output_dir,
            &stem,
            (image.ext, &image.bytes),
            (SIDECAR_EXTENSION, sidecar_text.as_bytes()),
        )?;

        log::info!(
            "{}: {:.2}% different ({} px), {:?}",
            item.file_name(),
            comparison.percent_diff * 100.0,
            comparison.diff_pixels,
            classification
        );
        Ok(ReplayOutcome::Succeeded {
            sidecar: item.sidecar_path.clone(),
            output,
            verification: Some(Verification {
                comparison,
                classification,
            }),
        })
    }
}

/// The service's infotext plus the item's template lines, if any.
fn compose_sidecar(infotext: &str, item: &GenerationParameters) -> String {
    let mut text = infotext.trim_end().to_string();
    if let Some(template) = &item.template {
        text.push_str("\nTemplate: ");
        text.push_str(template);
    }
    if let Some(negative) = &item.negative_template {
        text.push_str("\nNegative Template: ");
        text.push_str(negative);
    }
    text
}
